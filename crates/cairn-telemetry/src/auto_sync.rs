//! Background sync scheduling
//!
//! One tokio task per service. It fires a sync cycle on every interval tick
//! and whenever the network comes back online. Triggers that arrive while a
//! cycle is running are dropped, not queued.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, TelemetryError};
use crate::network::{NetworkInfo, NetworkStatus};
use crate::prefs::{SharedPreferences, KEY_AUTO_SYNC_INTERVAL, KEY_AUTO_SYNC_MODE};
use crate::sync::{SyncHandler, SyncRequest};

/// When background sync may run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AutoSyncMode {
    Off,
    /// Only while the network is reported online
    OverWifi,
    #[default]
    AlwaysOn,
}

impl AutoSyncMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoSyncMode::Off => "OFF",
            AutoSyncMode::OverWifi => "OVER_WIFI",
            AutoSyncMode::AlwaysOn => "ALWAYS_ON",
        }
    }

    /// Stored mode; missing or unknown values fall back to the default
    pub async fn load(preferences: &dyn SharedPreferences) -> Self {
        match preferences.get_string(KEY_AUTO_SYNC_MODE).await {
            Ok(Some(value)) => value.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %value, "unknown auto sync mode; using default");
                AutoSyncMode::default()
            }),
            Ok(None) => AutoSyncMode::default(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read auto sync mode");
                AutoSyncMode::default()
            }
        }
    }
}

impl fmt::Display for AutoSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AutoSyncMode {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFF" => Ok(AutoSyncMode::Off),
            "OVER_WIFI" => Ok(AutoSyncMode::OverWifi),
            "ALWAYS_ON" => Ok(AutoSyncMode::AlwaysOn),
            other => Err(TelemetryError::Parse(format!("unknown auto sync mode '{other}'"))),
        }
    }
}

/// Background sync scheduler
pub struct AutoSync {
    handler: Arc<SyncHandler>,
    preferences: Arc<dyn SharedPreferences>,
    network: Arc<dyn NetworkInfo>,
    default_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AutoSync {
    pub fn new(
        handler: Arc<SyncHandler>,
        preferences: Arc<dyn SharedPreferences>,
        network: Arc<dyn NetworkInfo>,
        default_interval: Duration,
    ) -> Self {
        Self {
            handler,
            preferences,
            network,
            default_interval,
            task: Mutex::new(None),
        }
    }

    pub async fn mode(&self) -> AutoSyncMode {
        AutoSyncMode::load(self.preferences.as_ref()).await
    }

    pub async fn set_mode(&self, mode: AutoSyncMode) -> Result<()> {
        self.preferences
            .put_string(KEY_AUTO_SYNC_MODE, mode.as_str())
            .await
            .map_err(TelemetryError::store)?;
        tracing::info!(mode = %mode, "auto sync mode changed");
        Ok(())
    }

    /// Tick interval, honouring the preference override
    pub async fn interval(&self) -> Duration {
        let stored = match self.preferences.get_string(KEY_AUTO_SYNC_INTERVAL).await {
            Ok(value) => value.and_then(|v| v.trim().parse::<u64>().ok()),
            Err(e) => {
                tracing::warn!(error = %e, "could not read auto sync interval");
                None
            }
        };
        match stored {
            Some(secs) if secs > 0 => Duration::from_secs(secs),
            _ => self.default_interval,
        }
    }

    /// Spawn the scheduler task; a no-op while it is already running
    pub async fn start(&self) {
        let interval = self.interval().await;
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let handler = self.handler.clone();
        let network = self.network.subscribe();
        let status = *network.borrow();
        *task = Some(tokio::spawn(run_scheduler(handler, network, status, interval)));
        tracing::debug!(interval_secs = interval.as_secs(), "auto sync started");
    }

    pub fn stop(&self) {
        let mut task = match self.task.lock() {
            Ok(task) => task,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handle) = task.take() {
            handle.abort();
            tracing::debug!("auto sync stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().is_some_and(|handle| !handle.is_finished()),
            Err(poisoned) => poisoned
                .into_inner()
                .as_ref()
                .is_some_and(|handle| !handle.is_finished()),
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_scheduler(
    handler: Arc<SyncHandler>,
    network: watch::Receiver<NetworkStatus>,
    mut last_status: NetworkStatus,
    period: Duration,
) {
    // A zero period would panic
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    // Changes made after `start` still arrive through `changed`
    let mut network = Some(network);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = next_status(&mut network) => {
                let Some(status) = changed else {
                    // Monitor is gone; keep ticking
                    network = None;
                    continue;
                };
                let came_online = last_status == NetworkStatus::Offline && status == NetworkStatus::Online;
                last_status = status;
                if !came_online {
                    continue;
                }
                tracing::debug!("network came online; triggering sync");
            }
        }

        match handler.try_handle(SyncRequest::default()).await {
            None => {}
            Some(stat) => match stat.error {
                Some(error) => tracing::warn!(error = %error, "background sync failed"),
                None => tracing::debug!(events = stat.synced_event_count, "background sync finished"),
            },
        }
    }
}

async fn next_status(network: &mut Option<watch::Receiver<NetworkStatus>>) -> Option<NetworkStatus> {
    match network {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
