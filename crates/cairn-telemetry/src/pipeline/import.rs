//! Import of an exported telemetry file
//!
//! Batches from the file join the local upload queue unchanged. Batches whose
//! message id is already queued are skipped, and each export is recorded once
//! in `imported_metadata`, so importing the same file twice is harmless.

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;

use super::manifest::ExportManifest;
use super::Stage;
use crate::error::{Result, TelemetryError};
use crate::events::ShareDirection;
use crate::recorder::TelemetryRecorder;
use crate::request::{ShareItemRequest, ShareRequest, TelemetryRequest};
use crate::schema::{
    ImportedMetadata, ProcessedBatch, COLUMN_IMPORTED_ID, COLUMN_MSG_ID, IMPORTED_METADATA_TABLE,
    METADATA_TABLE, PROCESSED_TABLE,
};
use crate::store::{InsertQuery, ReadQuery, StoredRow, TableService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTelemetryRequest {
    pub source_db_file_path: PathBuf,
}

/// State threaded through the import stages
#[derive(Default)]
pub struct ImportContext {
    pub source_db_file_path: PathBuf,
    pub manifest: Option<ExportManifest>,
    /// Batches copied into the local queue
    pub imported_batches: u64,
    pub file_size: u64,
    source: Option<Arc<dyn TableService>>,
}

impl ImportContext {
    pub fn new(request: ImportTelemetryRequest) -> Self {
        Self {
            source_db_file_path: request.source_db_file_path,
            ..Default::default()
        }
    }

    fn manifest(&self) -> Result<&ExportManifest> {
        self.manifest
            .as_ref()
            .ok_or_else(|| TelemetryError::Validation("import metadata not validated".to_string()))
    }
}

/// Opens the source file and checks its manifest
pub struct ValidateTelemetryMetadata {
    store: Arc<dyn TableService>,
}

impl ValidateTelemetryMetadata {
    pub fn new(store: Arc<dyn TableService>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage<ImportContext> for ValidateTelemetryMetadata {
    fn name(&self) -> &'static str {
        "validate_telemetry_metadata"
    }

    async fn run(&self, mut ctx: ImportContext) -> Result<ImportContext> {
        // Opening a missing file would silently create an empty database
        ctx.file_size = tokio::fs::metadata(&ctx.source_db_file_path).await?.len();

        let source = self
            .store
            .open(&ctx.source_db_file_path)
            .await
            .map_err(TelemetryError::store)?;

        let rows = source
            .read(&ReadQuery::table(METADATA_TABLE))
            .await
            .map_err(TelemetryError::store)?;
        let manifest = ExportManifest::from_rows(&rows)?;
        manifest.validate()?;

        let batches = read_source_batches(source.as_ref())
            .await?
            .iter()
            .map(ProcessedBatch::from_stored)
            .collect::<Result<Vec<_>>>()?;
        manifest.verify(&batches)?;
        // A batch the collector cannot parse would stall the upload queue
        for batch in &batches {
            if serde_json::from_str::<serde_json::Value>(&batch.data).is_err() {
                return Err(TelemetryError::Validation(format!(
                    "batch {} does not hold valid JSON",
                    batch.msg_id
                )));
            }
        }

        tracing::debug!(export_id = %manifest.export_id, did = %manifest.did, events = manifest.events_count, "import metadata valid");
        ctx.manifest = Some(manifest);
        ctx.source = Some(source);
        Ok(ctx)
    }
}

async fn read_source_batches(source: &dyn TableService) -> Result<Vec<StoredRow>> {
    source
        .read(&ReadQuery::table(PROCESSED_TABLE))
        .await
        .map_err(TelemetryError::store)
}

/// Copies the file's batches into the local queue
pub struct TransportProcessedTelemetry {
    store: Arc<dyn TableService>,
}

impl TransportProcessedTelemetry {
    pub fn new(store: Arc<dyn TableService>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage<ImportContext> for TransportProcessedTelemetry {
    fn name(&self) -> &'static str {
        "transport_processed_telemetry"
    }

    async fn run(&self, mut ctx: ImportContext) -> Result<ImportContext> {
        let source = ctx
            .source
            .take()
            .ok_or_else(|| TelemetryError::Validation("import source is not open".to_string()))?;

        let mut imported = 0;
        for stored in read_source_batches(source.as_ref()).await? {
            let batch = ProcessedBatch::from_stored(&stored)?;
            let existing = self
                .store
                .read(
                    &ReadQuery::table(PROCESSED_TABLE)
                        .where_eq(COLUMN_MSG_ID, batch.msg_id.as_str())
                        .limit(1),
                )
                .await
                .map_err(TelemetryError::store)?;
            if !existing.is_empty() {
                tracing::debug!(msg_id = %batch.msg_id, "batch already queued; skipping");
                continue;
            }

            self.store
                .insert(InsertQuery::new(PROCESSED_TABLE, batch.to_row()).at_offset(stored.offset))
                .await
                .map_err(TelemetryError::store)?;
            imported += 1;
        }

        tracing::info!(batches = imported, "imported telemetry batches");
        ctx.imported_batches = imported;
        Ok(ctx)
    }
}

/// Records the import once per export id
pub struct UpdateImportedTelemetryMetadata {
    store: Arc<dyn TableService>,
}

impl UpdateImportedTelemetryMetadata {
    pub fn new(store: Arc<dyn TableService>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage<ImportContext> for UpdateImportedTelemetryMetadata {
    fn name(&self) -> &'static str {
        "update_imported_telemetry_metadata"
    }

    async fn run(&self, ctx: ImportContext) -> Result<ImportContext> {
        let manifest = ctx.manifest()?;
        let existing = self
            .store
            .read(
                &ReadQuery::table(IMPORTED_METADATA_TABLE)
                    .where_eq(COLUMN_IMPORTED_ID, manifest.export_id.as_str())
                    .limit(1),
            )
            .await
            .map_err(TelemetryError::store)?;
        if !existing.is_empty() {
            return Ok(ctx);
        }

        let record = ImportedMetadata {
            imported_id: manifest.export_id.clone(),
            device_id: manifest.did.clone(),
            count: manifest.events_count,
            imported_at: Utc::now().timestamp_millis(),
        };
        self.store
            .insert(InsertQuery::new(IMPORTED_METADATA_TABLE, record.to_row()))
            .await
            .map_err(TelemetryError::store)?;
        Ok(ctx)
    }
}

/// Records the import as an incoming share
pub struct GenerateImportTelemetryShare {
    recorder: Arc<TelemetryRecorder>,
}

impl GenerateImportTelemetryShare {
    pub fn new(recorder: Arc<TelemetryRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Stage<ImportContext> for GenerateImportTelemetryShare {
    fn name(&self) -> &'static str {
        "generate_import_telemetry_share"
    }

    async fn run(&self, ctx: ImportContext) -> Result<ImportContext> {
        let manifest = ctx.manifest()?;
        let request = ShareRequest {
            dir: ShareDirection::In,
            kind: "File".to_string(),
            items: vec![ShareItemRequest {
                kind: "Telemetry".to_string(),
                origin: manifest.did.clone(),
                identifier: manifest.export_id.clone(),
                pkg_version: String::new(),
                transfer_count: manifest.events_count.max(0) as u64,
                size: ctx.file_size,
            }],
            env: "sdk".to_string(),
            ..Default::default()
        };
        self.recorder
            .capture(TelemetryRequest::Share(request))
            .await?;
        Ok(ctx)
    }
}
