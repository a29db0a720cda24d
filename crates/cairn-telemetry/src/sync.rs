//! Batched sync to the collector
//!
//! A cycle runs in two drains. Packing moves raw events (at or above the
//! sync offset) into batch rows of the processed table, one batch per call,
//! until nothing is left. Uploading then sends the oldest batch, deletes it on
//! success, and repeats. A failed upload leaves its batch queued for the next
//! cycle; batches uploaded before it stay uploaded.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::auto_sync::AutoSyncMode;
use crate::bus::{BusEvent, EventBus, TelemetryEvent};
use crate::config::TelemetryConfig;
use crate::error::{Result, TelemetryError};
use crate::network::{NetworkInfo, NetworkStatus};
use crate::prefs::{
    KeyValueStore, SharedPreferences, KEY_DEVICE_REGISTER_TTL, KEY_LAST_SYNCED_TIME_STAMP,
    KEY_LOG_MIN_ALLOWED_OFFSET, KEY_SYNC_MIN_OFFSET,
};
use crate::schema::{ProcessedBatch, RawEvent, PROCESSED_TABLE, TELEMETRY_TABLE};
use crate::service::Collaborators;
use crate::store::{AggregateQuery, InsertQuery, ReadQuery, TableService};
use crate::transport::{ApiRequest, DeviceRegister, Transport};

/// Options for one sync cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncRequest {
    /// Pack raw events even below the sync threshold
    pub ignore_sync_threshold: bool,
    /// Sync even when auto-sync is switched off
    pub ignore_auto_sync_mode: bool,
}

impl SyncRequest {
    /// Explicit user-initiated sync: no threshold, no mode check
    pub fn forced() -> Self {
        Self {
            ignore_sync_threshold: true,
            ignore_auto_sync_mode: true,
        }
    }
}

/// Outcome of one sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStat {
    pub synced_event_count: u64,
    /// Set when the cycle uploaded at least one event without error
    pub sync_time: Option<i64>,
    pub synced_batch_bytes: u64,
    pub error: Option<String>,
}

/// One batch the collector accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedBatch {
    pub msg_id: String,
    pub event_count: u64,
    pub bytes: u64,
    pub server_ets: Option<i64>,
}

/// Drives sync cycles against the local store
pub struct SyncHandler {
    config: TelemetryConfig,
    device_id: String,
    store: Arc<dyn TableService>,
    key_value_store: Arc<dyn KeyValueStore>,
    preferences: Arc<dyn SharedPreferences>,
    transport: Arc<dyn Transport>,
    device_register: Arc<dyn DeviceRegister>,
    network: Arc<dyn NetworkInfo>,
    events: Arc<dyn EventBus>,
    last_synced: watch::Sender<Option<i64>>,
    cycle: Mutex<()>,
}

impl SyncHandler {
    pub fn new(config: TelemetryConfig, deps: &Collaborators) -> Self {
        let (last_synced, _) = watch::channel(None);
        Self {
            device_id: deps.device.device_id(),
            config,
            store: deps.store.clone(),
            key_value_store: deps.key_value_store.clone(),
            preferences: deps.preferences.clone(),
            transport: deps.transport.clone(),
            device_register: deps.device_register.clone(),
            network: deps.network.clone(),
            events: deps.events.clone(),
            last_synced,
            cycle: Mutex::new(()),
        }
    }

    /// Seed the last-synced cell from preferences
    pub async fn load_last_synced(&self) {
        match self.preferences.get_string(KEY_LAST_SYNCED_TIME_STAMP).await {
            Ok(Some(value)) if !value.is_empty() => match value.parse::<i64>() {
                Ok(ts) => {
                    self.last_synced.send_replace(Some(ts));
                }
                Err(e) => tracing::error!(value = %value, error = %e, "stored last sync time is not a timestamp"),
            },
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "could not read last sync time"),
        }
    }

    /// Live last-synced timestamp; every subscriber sees each new value
    pub fn last_synced_timestamp(&self) -> watch::Receiver<Option<i64>> {
        self.last_synced.subscribe()
    }

    /// Run a cycle, waiting for any cycle already in flight
    pub async fn handle(&self, request: SyncRequest) -> SyncStat {
        let _cycle = self.cycle.lock().await;
        self.run_cycle(request).await
    }

    /// Run a cycle unless one is already in flight
    pub async fn try_handle(&self, request: SyncRequest) -> Option<SyncStat> {
        let Ok(_cycle) = self.cycle.try_lock() else {
            tracing::debug!("sync cycle already running; trigger suppressed");
            return None;
        };
        Some(self.run_cycle(request).await)
    }

    /// Pack one batch of eligible raw events; 0 when none are left
    ///
    /// Waits for any sync cycle in flight.
    pub async fn process_events_batch(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let min_offset = self.sync_min_offset().await;
        self.pack_batch(min_offset).await
    }

    /// Pack every eligible raw event, serialized with sync cycles
    pub async fn process_all_events(&self) -> Result<usize> {
        let _cycle = self.cycle.lock().await;
        let min_offset = self.sync_min_offset().await;
        self.drain_raw_events(min_offset).await
    }

    /// Upload the oldest queued batch
    ///
    /// `Ok(None)` means nothing was uploaded: the queue is empty, or dry-run
    /// mode kept the batch local.
    pub async fn sync_processed_batch(&self) -> Result<Option<UploadedBatch>> {
        let mut dropped = 0;
        let (batch, body) = loop {
            if dropped >= self.config.max_batches_per_cycle {
                tracing::warn!(dropped, "unreadable batches keep reappearing; upload deferred");
                return Ok(None);
            }
            let rows = self
                .store
                .read(&ReadQuery::table(PROCESSED_TABLE).limit(1))
                .await
                .map_err(TelemetryError::store)?;
            let Some(stored) = rows.first() else {
                return Ok(None);
            };

            let parsed = ProcessedBatch::from_stored(stored).and_then(|batch| {
                let body = serde_json::from_str::<Value>(&batch.data)
                    .map_err(|e| TelemetryError::Parse(format!("batch {}: {e}", batch.msg_id)))?;
                Ok((batch, body))
            });
            match parsed {
                Ok(readable) => break readable,
                Err(e) => {
                    // An unreadable head batch would block the queue
                    tracing::warn!(offset = stored.offset, error = %e, "dropping unreadable batch");
                    self.store
                        .delete(PROCESSED_TABLE, &[stored.offset])
                        .await
                        .map_err(TelemetryError::store)?;
                    dropped += 1;
                }
            }
        };

        if self.config.debug {
            tracing::info!(msg_id = %batch.msg_id, events = batch.event_count, payload = %batch.data, "dry run: batch not uploaded");
            return Ok(None);
        }

        let response = self
            .transport
            .fetch(ApiRequest {
                url: self.config.sync_url(),
                body,
            })
            .await
            .map_err(|e| TelemetryError::Transport(format!("{e:#}")))?;
        if !response.is_success() {
            return Err(TelemetryError::Rejected {
                status: response.status,
            });
        }

        self.store
            .delete(PROCESSED_TABLE, &[batch.offset])
            .await
            .map_err(TelemetryError::store)?;

        tracing::debug!(msg_id = %batch.msg_id, events = batch.event_count, "batch uploaded");
        Ok(Some(UploadedBatch {
            msg_id: batch.msg_id,
            event_count: batch.event_count.max(0) as u64,
            bytes: batch.data.len() as u64,
            server_ets: response.server_ets(),
        }))
    }

    /// Force device registration on the next cycle
    pub async fn reset_device_register_ttl(&self) -> Result<()> {
        self.preferences
            .put_string(KEY_DEVICE_REGISTER_TTL, "")
            .await
            .map_err(TelemetryError::store)
    }

    async fn run_cycle(&self, request: SyncRequest) -> SyncStat {
        let mut stat = SyncStat::default();
        if !self.config.enabled {
            return stat;
        }

        if let Err(e) = self.drive(request, &mut stat).await {
            if e.is_transport() {
                tracing::warn!(error = %e, synced = stat.synced_event_count, "collector unavailable; batch stays queued");
            } else {
                tracing::warn!(error = %e, synced = stat.synced_event_count, "sync cycle stopped early");
            }
            stat.error = Some(e.to_string());
        }

        if stat.error.is_none() && stat.synced_event_count > 0 {
            let now = Utc::now().timestamp_millis();
            if let Err(e) = self
                .preferences
                .put_string(KEY_LAST_SYNCED_TIME_STAMP, &now.to_string())
                .await
            {
                tracing::warn!(error = %e, "could not persist last sync time");
            }
            self.last_synced.send_replace(Some(now));
            stat.sync_time = Some(now);
            self.events.emit(BusEvent::telemetry(TelemetryEvent::Synced {
                synced_event_count: stat.synced_event_count,
                sync_time: now,
            }));
            tracing::info!(events = stat.synced_event_count, bytes = stat.synced_batch_bytes, "telemetry synced");
        }

        stat
    }

    async fn drive(&self, mut request: SyncRequest, stat: &mut SyncStat) -> Result<()> {
        let online = self.network.network_status() == NetworkStatus::Online;
        if online {
            request.ignore_sync_threshold = true;
        }

        if !request.ignore_auto_sync_mode {
            match AutoSyncMode::load(self.preferences.as_ref()).await {
                AutoSyncMode::Off => {
                    tracing::debug!("auto sync is off; skipping cycle");
                    return Ok(());
                }
                AutoSyncMode::OverWifi if !online => {
                    tracing::debug!("auto sync waits for an unmetered network");
                    return Ok(());
                }
                _ => {}
            }
        }

        self.register_device_if_expired().await;

        let min_offset = self.sync_min_offset().await;
        if request.ignore_sync_threshold || self.threshold_crossed().await? {
            self.drain_raw_events(min_offset).await?;
        }

        for _ in 0..self.config.max_batches_per_cycle {
            let Some(batch) = self.sync_processed_batch().await? else {
                return Ok(());
            };
            stat.synced_event_count += batch.event_count;
            stat.synced_batch_bytes += batch.bytes;
            self.record_clock_skew(batch.server_ets).await;
        }

        tracing::warn!(cap = self.config.max_batches_per_cycle, "upload drain hit its iteration cap");
        Ok(())
    }

    async fn drain_raw_events(&self, min_offset: i64) -> Result<usize> {
        let mut packed = 0;
        for _ in 0..self.config.max_batches_per_cycle {
            let count = self.pack_batch(min_offset).await?;
            if count == 0 {
                return Ok(packed);
            }
            packed += count;
        }

        tracing::warn!(cap = self.config.max_batches_per_cycle, packed, "packing drain hit its iteration cap");
        Ok(packed)
    }

    /// Returns the number of raw rows consumed
    async fn pack_batch(&self, min_offset: i64) -> Result<usize> {
        let rows = self
            .store
            .read(
                &ReadQuery::table(TELEMETRY_TABLE)
                    .from_offset(min_offset)
                    .limit(self.config.batch_size),
            )
            .await
            .map_err(TelemetryError::store)?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut events = Vec::with_capacity(rows.len());
        let mut priority = i64::MAX;
        for stored in &rows {
            let parsed = RawEvent::from_stored(stored).and_then(|raw| {
                let event = serde_json::from_str::<Value>(&raw.event)?;
                Ok((raw.priority, event))
            });
            match parsed {
                Ok((row_priority, event)) => {
                    priority = priority.min(row_priority);
                    events.push(event);
                }
                Err(e) => {
                    tracing::warn!(offset = stored.offset, error = %e, "dropping unreadable telemetry row")
                }
            }
        }
        let offsets: Vec<i64> = rows.iter().map(|stored| stored.offset).collect();

        if !events.is_empty() {
            let msg_id = Uuid::new_v4().to_string();
            let payload = json!({
                "id": "api.telemetry",
                "ver": "1.0",
                "ets": Utc::now().timestamp_millis(),
                "params": {
                    "did": self.device_id,
                    "msgid": msg_id,
                },
                "events": events,
            });
            let batch = ProcessedBatch {
                offset: 0,
                msg_id,
                data: serde_json::to_string(&payload)?,
                event_count: events.len() as i64,
                priority,
            };
            self.store
                .insert(InsertQuery::new(PROCESSED_TABLE, batch.to_row()))
                .await
                .map_err(TelemetryError::store)?;
            tracing::debug!(msg_id = %batch.msg_id, events = batch.event_count, "packed batch");
        }

        self.store
            .delete(TELEMETRY_TABLE, &offsets)
            .await
            .map_err(TelemetryError::store)?;

        Ok(rows.len())
    }

    async fn threshold_crossed(&self) -> Result<bool> {
        let count = self
            .store
            .execute(&AggregateQuery::count(TELEMETRY_TABLE))
            .await
            .map_err(TelemetryError::store)?;
        Ok(count >= 0 && count as u64 >= self.config.sync_threshold)
    }

    async fn register_device_if_expired(&self) {
        let now = Utc::now().timestamp_millis();
        let expiry = match self.preferences.get_string(KEY_DEVICE_REGISTER_TTL).await {
            Ok(value) => value.and_then(|v| v.parse::<i64>().ok()),
            Err(e) => {
                tracing::warn!(error = %e, "could not read device register TTL");
                None
            }
        };
        if expiry.is_some_and(|expiry| now < expiry) {
            return;
        }

        match self.device_register.register_device().await {
            Ok(()) => {
                let expiry = now + self.config.device_register_ttl_ms();
                if let Err(e) = self
                    .preferences
                    .put_string(KEY_DEVICE_REGISTER_TTL, &expiry.to_string())
                    .await
                {
                    tracing::warn!(error = %e, "could not store device register TTL");
                }
                tracing::debug!(expiry, "device registered");
            }
            // Sync proceeds; registration is retried next cycle
            Err(e) => tracing::warn!(error = %e, "device registration failed"),
        }
    }

    async fn sync_min_offset(&self) -> i64 {
        read_offset(self.key_value_store.as_ref(), KEY_SYNC_MIN_OFFSET)
            .await
            .max(0)
    }

    async fn record_clock_skew(&self, server_ets: Option<i64>) {
        let Some(server_ets) = server_ets else {
            return;
        };
        let skew = server_ets - Utc::now().timestamp_millis();
        if skew.abs() <= self.config.allowed_clock_skew_ms {
            return;
        }

        tracing::info!(skew, "collector clock differs from local clock");
        if let Err(e) = self
            .key_value_store
            .set_value(KEY_LOG_MIN_ALLOWED_OFFSET, &skew.to_string())
            .await
        {
            tracing::warn!(error = %e, "could not store clock skew");
        }
    }
}

/// Integer stored under `key`, 0 when missing or unreadable
pub(crate) async fn read_offset(store: &dyn KeyValueStore, key: &str) -> i64 {
    match store.get_value(key).await {
        Ok(Some(value)) if !value.trim().is_empty() => {
            value.trim().parse::<i64>().unwrap_or_else(|e| {
                tracing::warn!(key, value = %value, error = %e, "ignoring non-numeric offset");
                0
            })
        }
        Ok(_) => 0,
        Err(e) => {
            tracing::warn!(key, error = %e, "could not read offset");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryStore;

    #[tokio::test]
    async fn test_read_offset_defaults() {
        let store = MemoryStore::new();
        assert_eq!(read_offset(&store, KEY_SYNC_MIN_OFFSET).await, 0);

        store.set_value(KEY_SYNC_MIN_OFFSET, "abc").await.unwrap();
        assert_eq!(read_offset(&store, KEY_SYNC_MIN_OFFSET).await, 0);

        store.set_value(KEY_SYNC_MIN_OFFSET, " 42 ").await.unwrap();
        assert_eq!(read_offset(&store, KEY_SYNC_MIN_OFFSET).await, 42);
    }

    #[test]
    fn test_forced_request() {
        let request = SyncRequest::forced();
        assert!(request.ignore_sync_threshold);
        assert!(request.ignore_auto_sync_mode);
        assert_eq!(SyncRequest::default(), SyncRequest {
            ignore_sync_threshold: false,
            ignore_auto_sync_mode: false,
        });
    }
}
