//! The telemetry service
//!
//! Entry point for hosts. Capture calls and imports report `false` on failure
//! and log why; nothing here panics or aborts the host.

use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;

use crate::auto_sync::AutoSync;
use crate::bus::EventBus;
use crate::config::TelemetryConfig;
use crate::device::DeviceInfo;
use crate::error::{Result, TelemetryError};
use crate::events::Context;
use crate::network::NetworkInfo;
use crate::pipeline::export::{
    self, CleanupExportedFile, CopyDatabase, CreateExportFile, CreateMetaData,
    GenerateShareTelemetry,
};
use crate::pipeline::import::{
    GenerateImportTelemetryShare, TransportProcessedTelemetry, UpdateImportedTelemetryMetadata,
    ValidateTelemetryMetadata,
};
use crate::pipeline::{
    ExportContext, ExportResponse, ExportTelemetryRequest, ImportContext, ImportTelemetryRequest,
    Pipeline,
};
use crate::prefs::{KeyValueStore, SharedPreferences, KEY_LAST_SYNCED_TIME_STAMP};
use crate::recorder::TelemetryRecorder;
use crate::request::{
    AuditRequest, EndRequest, ErrorRequest, FeedbackRequest, ImpressionRequest, InteractRequest,
    InterruptRequest, LogRequest, ShareRequest, StartRequest, TelemetryRequest,
};
use crate::schema::{COLUMN_NUMBER_OF_EVENTS, PROCESSED_TABLE, TELEMETRY_TABLE};
use crate::session::SessionProvider;
use crate::store::{AggregateQuery, TableService};
use crate::sync::{SyncHandler, SyncRequest, SyncStat};
use crate::transport::{DeviceRegister, Transport};

/// External collaborators the service is built from
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn TableService>,
    pub key_value_store: Arc<dyn KeyValueStore>,
    pub preferences: Arc<dyn SharedPreferences>,
    pub transport: Arc<dyn Transport>,
    pub device_register: Arc<dyn DeviceRegister>,
    pub sessions: Arc<dyn SessionProvider>,
    pub device: Arc<dyn DeviceInfo>,
    pub network: Arc<dyn NetworkInfo>,
    pub events: Arc<dyn EventBus>,
}

/// Events waiting to be uploaded and the last successful sync
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStat {
    /// Raw events plus events packed into queued batches
    pub un_synced_event_count: i64,
    /// Epoch millis, 0 when never synced
    pub last_sync_time: i64,
}

pub struct TelemetryService {
    config: TelemetryConfig,
    store: Arc<dyn TableService>,
    preferences: Arc<dyn SharedPreferences>,
    network: Arc<dyn NetworkInfo>,
    recorder: Arc<TelemetryRecorder>,
    sync: Arc<SyncHandler>,
    auto_sync: OnceLock<AutoSync>,
}

impl TelemetryService {
    pub fn new(config: TelemetryConfig, deps: Collaborators) -> Self {
        Self {
            recorder: Arc::new(TelemetryRecorder::new(&config, &deps)),
            sync: Arc::new(SyncHandler::new(config.clone(), &deps)),
            store: deps.store,
            preferences: deps.preferences,
            network: deps.network,
            auto_sync: OnceLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Load persisted sync state
    pub async fn init(&self) {
        self.sync.load_last_synced().await;
        tracing::debug!(enabled = self.config.enabled, device_id = %self.recorder.decorator().device_id(), "telemetry service initialised");
    }

    /// Persist a record given as raw JSON
    pub async fn save_telemetry(&self, raw: &str) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.recorder.save_raw(raw).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "telemetry not saved");
                false
            }
        }
    }

    /// Validate, build and persist a capture request
    pub async fn capture(&self, request: TelemetryRequest) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.recorder.capture(request).await {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "telemetry not captured");
                false
            }
        }
    }

    pub async fn audit(&self, request: AuditRequest) -> bool {
        self.capture(TelemetryRequest::Audit(request)).await
    }

    pub async fn interact(&self, request: InteractRequest) -> bool {
        self.capture(TelemetryRequest::Interact(request)).await
    }

    pub async fn impression(&self, request: ImpressionRequest) -> bool {
        self.capture(TelemetryRequest::Impression(request)).await
    }

    pub async fn start(&self, request: StartRequest) -> bool {
        self.capture(TelemetryRequest::Start(request)).await
    }

    pub async fn end(&self, request: EndRequest) -> bool {
        self.capture(TelemetryRequest::End(request)).await
    }

    pub async fn error(&self, request: ErrorRequest) -> bool {
        self.capture(TelemetryRequest::Error(request)).await
    }

    pub async fn log(&self, request: LogRequest) -> bool {
        self.capture(TelemetryRequest::Log(request)).await
    }

    pub async fn share(&self, request: ShareRequest) -> bool {
        self.capture(TelemetryRequest::Share(request)).await
    }

    pub async fn feedback(&self, request: FeedbackRequest) -> bool {
        self.capture(TelemetryRequest::Feedback(request)).await
    }

    pub async fn interrupt(&self, request: InterruptRequest) -> bool {
        self.capture(TelemetryRequest::Interrupt(request)).await
    }

    /// Run one sync cycle
    pub async fn sync(&self, request: Option<SyncRequest>) -> SyncStat {
        self.sync.handle(request.unwrap_or_default()).await
    }

    pub fn sync_handler(&self) -> &Arc<SyncHandler> {
        &self.sync
    }

    /// Write every queued batch to a portable file under the destination folder
    pub async fn export_telemetry(&self, request: ExportTelemetryRequest) -> Result<ExportResponse> {
        let ctx = ExportContext::new(request);
        let staging = ctx.staging_dir();
        match self.run_export(ctx).await {
            Ok(response) => {
                tracing::info!(path = %response.exported_file_path.display(), "telemetry exported");
                Ok(response)
            }
            Err(e) => {
                tracing::warn!(error = %e, "telemetry export failed");
                export::discard_staging(&staging).await;
                Err(e)
            }
        }
    }

    async fn run_export(&self, ctx: ExportContext) -> Result<ExportResponse> {
        self.sync.process_all_events().await?;

        let device_id = self.recorder.decorator().device_id().to_string();
        let pipeline = Pipeline::new("export")
            .stage(CreateExportFile::new(&device_id))
            .stage(CopyDatabase::new(self.store.clone()))
            .stage(CreateMetaData::new(self.store.clone(), &device_id))
            .stage(CleanupExportedFile)
            .stage(GenerateShareTelemetry::new(self.recorder.clone()));

        let ctx = pipeline.run(ctx).await?;
        Ok(ExportResponse {
            exported_file_path: ctx.destination_path,
        })
    }

    /// Queue the batches of an exported file for upload
    pub async fn import_telemetry(&self, request: ImportTelemetryRequest) -> bool {
        let source = request.source_db_file_path.clone();
        let pipeline = Pipeline::new("import")
            .stage(ValidateTelemetryMetadata::new(self.store.clone()))
            .stage(TransportProcessedTelemetry::new(self.store.clone()))
            .stage(UpdateImportedTelemetryMetadata::new(self.store.clone()))
            .stage(UpdateImportedTelemetryMetadata::new(self.store.clone()))
            .stage(GenerateImportTelemetryShare::new(self.recorder.clone()));

        match pipeline.run(ImportContext::new(request)).await {
            Ok(ctx) => {
                tracing::info!(path = %source.display(), batches = ctx.imported_batches, "telemetry imported");
                true
            }
            Err(e) => {
                tracing::warn!(path = %source.display(), error = %e, "telemetry import failed");
                false
            }
        }
    }

    pub async fn get_telemetry_stat(&self) -> Result<TelemetryStat> {
        let raw_query = AggregateQuery::count(TELEMETRY_TABLE);
        let processed_query = AggregateQuery::sum(PROCESSED_TABLE, COLUMN_NUMBER_OF_EVENTS);
        let (raw, processed) = tokio::join!(
            self.store.execute(&raw_query),
            self.store.execute(&processed_query)
        );
        let raw = raw.map_err(TelemetryError::store)?;
        let processed = processed.map_err(TelemetryError::store)?;

        let last_sync_time = match self
            .preferences
            .get_string(KEY_LAST_SYNCED_TIME_STAMP)
            .await
            .map_err(TelemetryError::store)?
        {
            Some(value) if !value.is_empty() => value.parse::<i64>().map_err(|e| {
                TelemetryError::Parse(format!("last sync time '{value}': {e}"))
            })?,
            _ => 0,
        };

        Ok(TelemetryStat {
            un_synced_event_count: raw + processed,
            last_sync_time,
        })
    }

    /// Subscribe to the last successful sync time
    pub fn last_synced_timestamp(&self) -> watch::Receiver<Option<i64>> {
        self.sync.last_synced_timestamp()
    }

    pub async fn reset_device_register_ttl(&self) -> Result<()> {
        self.sync.reset_device_register_ttl().await
    }

    /// Background sync scheduler, created on first use
    pub fn auto_sync(&self) -> &AutoSync {
        self.auto_sync.get_or_init(|| {
            AutoSync::new(
                self.sync.clone(),
                self.preferences.clone(),
                self.network.clone(),
                Duration::from_secs(self.config.auto_sync_interval_secs),
            )
        })
    }

    /// Context for records built by the host itself
    pub fn build_context(&self, session_id: &str, channel_id: Option<&str>) -> Context {
        self.recorder.decorator().build_context(session_id, channel_id)
    }
}
