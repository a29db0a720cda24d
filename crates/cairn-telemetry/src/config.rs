//! Telemetry configuration loading and validation

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Default collector host
const DEFAULT_HOST: &str = "https://telemetry.cairn.dev";

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Whether telemetry is captured and synced (default: true)
    pub enabled: bool,

    /// Dry-run mode: batches are logged instead of uploaded and stay queued
    pub debug: bool,

    /// Collector base URL
    pub host: String,

    /// Path of the batch ingestion endpoint
    pub api_path: String,

    /// Path prefix of the device registration endpoint (device id is appended)
    pub device_register_path: String,

    /// Bearer token sent to the collector
    pub api_key: Option<String>,

    /// Maximum number of raw events packed into one batch
    pub batch_size: usize,

    /// Raw event count that must be reached before packing when offline
    pub sync_threshold: u64,

    /// Upper bound on drain iterations within one sync cycle
    pub max_batches_per_cycle: usize,

    /// Hours a device registration stays valid
    pub device_register_ttl_hours: i64,

    /// Seconds between background sync cycles
    pub auto_sync_interval_secs: u64,

    /// Clock skew (ms) tolerated before the collector time overrides local time
    pub allowed_clock_skew_ms: i64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,

    /// Channel used when the host has no active channel
    pub default_channel: String,

    /// Producer id stamped into `context.pdata`
    pub producer_id: String,

    /// Producer pid stamped into `context.pdata`
    pub producer_pid: String,

    /// Producer version stamped into `context.pdata`
    pub producer_version: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debug: false,
            host: DEFAULT_HOST.to_string(),
            api_path: "/api/data/v1/telemetry".to_string(),
            device_register_path: "/api/v3/device/register".to_string(),
            api_key: None,
            batch_size: 200,
            sync_threshold: 200,
            max_batches_per_cycle: 1000,
            device_register_ttl_hours: 24,
            auto_sync_interval_secs: 300,
            allowed_clock_skew_ms: 24 * 60 * 60 * 1000,
            request_timeout_secs: 30,
            default_channel: "in.cairn".to_string(),
            producer_id: "cairn.app".to_string(),
            producer_pid: "cairn.telemetry".to_string(),
            producer_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Full URL of the batch ingestion endpoint
    pub fn sync_url(&self) -> String {
        join_url(&self.host, &self.api_path)
    }

    /// Full URL of the registration endpoint for a device
    pub fn device_register_url(&self, device_id: &str) -> String {
        format!("{}/{}", join_url(&self.host, &self.device_register_path), device_id)
    }

    /// Device registration lifetime in milliseconds
    pub fn device_register_ttl_ms(&self) -> i64 {
        self.device_register_ttl_hours * 60 * 60 * 1000
    }
}

fn join_url(host: &str, path: &str) -> String {
    format!(
        "{}/{}",
        host.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Partially specified config, as read from one file layer
#[derive(Debug, Default, Deserialize)]
struct PartialTelemetryConfig {
    enabled: Option<bool>,
    debug: Option<bool>,
    host: Option<String>,
    api_path: Option<String>,
    device_register_path: Option<String>,
    api_key: Option<String>,
    batch_size: Option<usize>,
    sync_threshold: Option<u64>,
    max_batches_per_cycle: Option<usize>,
    device_register_ttl_hours: Option<i64>,
    auto_sync_interval_secs: Option<u64>,
    allowed_clock_skew_ms: Option<i64>,
    request_timeout_secs: Option<u64>,
    default_channel: Option<String>,
    producer_id: Option<String>,
    producer_pid: Option<String>,
    producer_version: Option<String>,
}

/// Load telemetry configuration with precedence:
/// 1. Environment variables (highest priority)
/// 2. Local config (.cairn/config.local.toml)
/// 3. Project config (.cairn/config.toml)
/// 4. User config (~/.cairn/config.toml)
/// 5. Default
pub fn load_telemetry_config() -> Result<TelemetryConfig> {
    let mut config = TelemetryConfig::default();

    let mut layers = Vec::new();
    if let Some(home_dir) = dirs::home_dir() {
        layers.push(home_dir.join(".cairn/config.toml"));
    }
    layers.push(PathBuf::from(".cairn/config.toml"));
    layers.push(PathBuf::from(".cairn/config.local.toml"));

    for path in layers {
        if !path.exists() {
            continue;
        }
        match load_config_from_file(&path) {
            Ok(layer) => merge_config(&mut config, layer),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable telemetry config"),
        }
    }

    apply_env_overrides(&mut config)?;
    validate(&config)?;

    Ok(config)
}

/// Load the `[telemetry]` section of a TOML file
fn load_config_from_file(path: &Path) -> Result<PartialTelemetryConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;

    #[derive(Deserialize)]
    struct FullConfig {
        #[serde(default)]
        telemetry: Option<PartialTelemetryConfig>,
    }

    let full_config: FullConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config: {}", path.display()))?;

    Ok(full_config.telemetry.unwrap_or_default())
}

/// Overlay the fields a layer sets onto the base config
fn merge_config(base: &mut TelemetryConfig, layer: PartialTelemetryConfig) {
    macro_rules! overlay {
        ($($field:ident),* $(,)?) => {
            $(if let Some(value) = layer.$field {
                base.$field = value;
            })*
        };
    }

    overlay!(
        enabled,
        debug,
        host,
        api_path,
        device_register_path,
        batch_size,
        sync_threshold,
        max_batches_per_cycle,
        device_register_ttl_hours,
        auto_sync_interval_secs,
        allowed_clock_skew_ms,
        request_timeout_secs,
        default_channel,
        producer_id,
        producer_pid,
        producer_version,
    );
    if layer.api_key.is_some() {
        base.api_key = layer.api_key;
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut TelemetryConfig) -> Result<()> {
    // CAIRN_TELEMETRY_DISABLED=1 disables telemetry
    if env::var("CAIRN_TELEMETRY_DISABLED").is_ok() {
        config.enabled = false;
    }

    // DO_NOT_TRACK=1 (universal opt-out)
    if env::var("DO_NOT_TRACK").is_ok() {
        config.enabled = false;
    }

    if env::var("CAIRN_TELEMETRY_DEBUG").is_ok() {
        config.debug = true;
    }

    if let Ok(host) = env::var("CAIRN_TELEMETRY_HOST") {
        if host.trim().is_empty() {
            anyhow::bail!("CAIRN_TELEMETRY_HOST is set but empty");
        }
        config.host = host;
    }

    Ok(())
}

fn validate(config: &TelemetryConfig) -> Result<()> {
    if config.batch_size == 0 {
        anyhow::bail!("telemetry.batch_size must be at least 1");
    }
    if config.max_batches_per_cycle == 0 {
        anyhow::bail!("telemetry.max_batches_per_cycle must be at least 1");
    }
    Ok(())
}

/// Get the telemetry state directory
pub fn get_telemetry_dir() -> Result<PathBuf> {
    let home_dir = dirs::home_dir().context("Could not determine home directory")?;
    let telemetry_dir = home_dir.join(".cairn").join("telemetry");
    fs::create_dir_all(&telemetry_dir)?;
    Ok(telemetry_dir)
}
