//! Capture path: decorate, prepare, persist
//!
//! Shared by the service's capture calls and by the pipeline stages that
//! record share events.

use std::sync::Arc;

use crate::bus::{BusEvent, EventBus, TelemetryEvent};
use crate::config::TelemetryConfig;
use crate::decorator::TelemetryDecorator;
use crate::error::{Result, TelemetryError};
use crate::events::TelemetryRecord;
use crate::prefs::{KeyValueStore, KEY_LOG_MIN_ALLOWED_OFFSET};
use crate::request::TelemetryRequest;
use crate::schema::TELEMETRY_TABLE;
use crate::service::Collaborators;
use crate::session::{SessionContext, SessionProvider};
use crate::store::{InsertQuery, TableService};
use crate::sync::read_offset;

/// Priority of rows written by capture calls
pub const DEFAULT_PRIORITY: i64 = 1;

pub struct TelemetryRecorder {
    decorator: TelemetryDecorator,
    store: Arc<dyn TableService>,
    key_value_store: Arc<dyn KeyValueStore>,
    sessions: Arc<dyn SessionProvider>,
    events: Arc<dyn EventBus>,
}

impl TelemetryRecorder {
    pub fn new(config: &TelemetryConfig, deps: &Collaborators) -> Self {
        Self {
            decorator: TelemetryDecorator::new(config, deps.device.device_id()),
            store: deps.store.clone(),
            key_value_store: deps.key_value_store.clone(),
            sessions: deps.sessions.clone(),
            events: deps.events.clone(),
        }
    }

    pub fn decorator(&self) -> &TelemetryDecorator {
        &self.decorator
    }

    /// Validate and persist a capture request; returns the message id
    pub async fn capture(&self, request: TelemetryRequest) -> Result<String> {
        request.validate()?;
        self.persist(request.into_record()).await
    }

    /// Parse and persist a raw JSON record; returns the message id
    pub async fn save_raw(&self, raw: &str) -> Result<String> {
        let record: TelemetryRecord =
            serde_json::from_str(raw).map_err(|e| TelemetryError::Parse(e.to_string()))?;
        self.persist(record).await
    }

    /// Decorate with the active session and append to the raw table
    pub async fn persist(&self, record: TelemetryRecord) -> Result<String> {
        let (session, skew) = tokio::join!(
            SessionContext::resolve(self.sessions.as_ref()),
            read_offset(self.key_value_store.as_ref(), KEY_LOG_MIN_ALLOWED_OFFSET)
        );

        let record = self.decorator.decorate_with(record, &session, skew);
        let prepared = self.decorator.prepare(&record, DEFAULT_PRIORITY)?;
        self.store
            .insert(InsertQuery::new(TELEMETRY_TABLE, prepared.to_row()))
            .await
            .map_err(TelemetryError::store)?;

        tracing::debug!(eid = %prepared.event_type, mid = %record.mid, "telemetry saved");
        self.events.emit(BusEvent::telemetry(TelemetryEvent::Saved {
            eid: prepared.event_type,
            mid: record.mid.clone(),
        }));
        Ok(record.mid)
    }
}
