//! Key-value and preference stores
//!
//! Two small string stores: the key-value store holds values shared across
//! processes (sync offsets), preferences hold per-install scalars (last sync
//! time, device-register TTL, auto-sync mode).

use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Key used for the last successful sync time (epoch millis)
pub const KEY_LAST_SYNCED_TIME_STAMP: &str = "last_synced_time_stamp";
/// Key holding the device registration expiry (epoch millis)
pub const KEY_DEVICE_REGISTER_TTL: &str = "device_register_ttl";
/// Key holding the auto-sync mode
pub const KEY_AUTO_SYNC_MODE: &str = "auto_sync_mode";
/// Key overriding the auto-sync interval in seconds
pub const KEY_AUTO_SYNC_INTERVAL: &str = "auto_sync_interval_secs";
/// Raw events below this offset are never packed
pub const KEY_SYNC_MIN_OFFSET: &str = "telemetry_sync_min_offset";
/// Collector clock skew in millis, added to event timestamps
pub const KEY_LOG_MIN_ALLOWED_OFFSET: &str = "telemetry_log_min_allowed_offset";

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn set_value(&self, key: &str, value: &str) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait SharedPreferences: Send + Sync {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>>;

    async fn put_string(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// In-memory store implementing both contracts
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn set_value(&self, key: &str, value: &str) -> anyhow::Result<bool> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(true)
    }
}

#[async_trait]
impl SharedPreferences for MemoryStore {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.get_value(key).await
    }

    async fn put_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.set_value(key, value).await.map(|_| ())
    }
}

/// Preferences persisted as a JSON object in one file
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<HashMap<String, String>>,
}

impl FilePreferences {
    /// Load preferences from `path`; a missing or corrupt file starts empty
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let values = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "discarding corrupt preferences file");
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read preferences: {}", path.display()))
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: Mutex::new(values),
        })
    }

    async fn save(&self, values: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(values)?;
        tokio::fs::write(&self.path, content)
            .await
            .with_context(|| format!("Failed to write preferences: {}", self.path.display()))?;
        Ok(())
    }
}

#[async_trait]
impl SharedPreferences for FilePreferences {
    async fn get_string(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn put_string(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut values = self.values.lock().await;
        values.insert(key.to_string(), value.to_string());
        self.save(&values).await
    }
}
