//! Export of the local store to a portable file
//!
//! The live database is snapshotted into `<destination>/tmp/<export id>/`,
//! the manifest is written into the snapshot, everything but the batch and
//! metadata tables is dropped, and only then is the file moved next to `tmp/`.
//! A file at the final path is therefore always complete. Only the export's
//! own staging directory is ever removed; `tmp/` itself goes only when empty.

use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use super::manifest::{ExportManifest, EXPORT_FILE_EXTENSION};
use super::Stage;
use crate::error::{Result, TelemetryError};
use crate::events::ShareDirection;
use crate::recorder::TelemetryRecorder;
use crate::request::{ShareItemRequest, ShareRequest, TelemetryRequest};
use crate::schema::{ProcessedBatch, METADATA_TABLE, PROCESSED_TABLE};
use crate::store::{InsertQuery, ReadQuery, TableService};

/// Staging directory name under the destination folder
pub const STAGING_DIR: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTelemetryRequest {
    pub destination_folder: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportResponse {
    pub exported_file_path: PathBuf,
}

/// State threaded through the export stages
#[derive(Default)]
pub struct ExportContext {
    pub destination_folder: PathBuf,
    pub staging_path: PathBuf,
    pub destination_path: PathBuf,
    pub export_id: String,
    pub events_count: i64,
    pub file_size: u64,
    exported: Option<Arc<dyn TableService>>,
}

impl ExportContext {
    pub fn new(request: ExportTelemetryRequest) -> Self {
        Self {
            destination_folder: request.destination_folder,
            export_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    /// Directory owned by this export
    pub fn staging_dir(&self) -> PathBuf {
        staging_dir(&self.destination_folder, &self.export_id)
    }

    fn exported(&self) -> Result<&Arc<dyn TableService>> {
        self.exported
            .as_ref()
            .ok_or_else(|| TelemetryError::Validation("exported copy is not open".to_string()))
    }
}

pub fn staging_dir(destination_folder: &Path, export_id: &str) -> PathBuf {
    destination_folder.join(STAGING_DIR).join(export_id)
}

/// Remove one export's staging directory, and `tmp/` if that leaves it empty
pub async fn discard_staging(staging_dir: &Path) {
    match tokio::fs::remove_dir_all(staging_dir).await {
        Ok(()) => tracing::debug!(path = %staging_dir.display(), "removed export staging dir"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %staging_dir.display(), error = %e, "could not remove export staging dir"),
    }
    if let Some(parent) = staging_dir.parent() {
        // Fails while anything else lives in tmp/
        let _ = tokio::fs::remove_dir(parent).await;
    }
}

async fn read_batches(store: &dyn TableService) -> Result<Vec<ProcessedBatch>> {
    store
        .read(&ReadQuery::table(PROCESSED_TABLE))
        .await
        .map_err(TelemetryError::store)?
        .iter()
        .map(ProcessedBatch::from_stored)
        .collect()
}

/// Allocates the staging and final file paths
pub struct CreateExportFile {
    device_id: String,
}

impl CreateExportFile {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl Stage<ExportContext> for CreateExportFile {
    fn name(&self) -> &'static str {
        "create_export_file"
    }

    async fn run(&self, mut ctx: ExportContext) -> Result<ExportContext> {
        // An empty id would make the staging dir `tmp/` itself
        if ctx.export_id.is_empty() {
            ctx.export_id = Uuid::new_v4().to_string();
        }
        let staging = ctx.staging_dir();
        tokio::fs::create_dir_all(&staging).await?;

        let did_prefix: String = self.device_id.chars().take(8).collect();
        let file_name = format!(
            "telemetry-{}-{}.{}",
            did_prefix,
            Utc::now().timestamp_millis(),
            EXPORT_FILE_EXTENSION
        );
        ctx.staging_path = staging.join(&file_name);
        ctx.destination_path = ctx.destination_folder.join(&file_name);
        Ok(ctx)
    }
}

/// Snapshots the live database into the staging path
pub struct CopyDatabase {
    store: Arc<dyn TableService>,
}

impl CopyDatabase {
    pub fn new(store: Arc<dyn TableService>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage<ExportContext> for CopyDatabase {
    fn name(&self) -> &'static str {
        "copy_database"
    }

    async fn run(&self, ctx: ExportContext) -> Result<ExportContext> {
        let copied = self
            .store
            .copy_database(&ctx.staging_path)
            .await
            .map_err(TelemetryError::store)?;
        if !copied {
            return Err(TelemetryError::store(anyhow::anyhow!(
                "database copy to {} was refused",
                ctx.staging_path.display()
            )));
        }
        Ok(ctx)
    }
}

/// Writes the export manifest into the copy
pub struct CreateMetaData {
    store: Arc<dyn TableService>,
    device_id: String,
}

impl CreateMetaData {
    pub fn new(store: Arc<dyn TableService>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
        }
    }
}

#[async_trait]
impl Stage<ExportContext> for CreateMetaData {
    fn name(&self) -> &'static str {
        "create_meta_data"
    }

    async fn run(&self, mut ctx: ExportContext) -> Result<ExportContext> {
        let exported = self
            .store
            .open(&ctx.staging_path)
            .await
            .map_err(TelemetryError::store)?;

        let batches = read_batches(exported.as_ref()).await?;
        let manifest = ExportManifest::new(&self.device_id, &ctx.export_id, &batches);
        for row in manifest.to_rows()? {
            exported
                .insert(InsertQuery::new(METADATA_TABLE, row))
                .await
                .map_err(TelemetryError::store)?;
        }

        ctx.events_count = manifest.events_count;
        ctx.exported = Some(exported);
        Ok(ctx)
    }
}

/// Trims the copy to batches plus manifest and moves it into place
pub struct CleanupExportedFile;

#[async_trait]
impl Stage<ExportContext> for CleanupExportedFile {
    fn name(&self) -> &'static str {
        "cleanup_exported_file"
    }

    async fn run(&self, mut ctx: ExportContext) -> Result<ExportContext> {
        let exported = ctx.exported()?;
        for table in exported.tables().await.map_err(TelemetryError::store)? {
            if table != PROCESSED_TABLE && table != METADATA_TABLE {
                exported
                    .drop_table(&table)
                    .await
                    .map_err(TelemetryError::store)?;
            }
        }
        ctx.exported = None;

        ctx.file_size = tokio::fs::metadata(&ctx.staging_path).await?.len();
        tokio::fs::rename(&ctx.staging_path, &ctx.destination_path).await?;
        discard_staging(&ctx.staging_dir()).await;
        Ok(ctx)
    }
}

/// Records the export as an outgoing share
///
/// The file is already in place, so a failure here removes it again.
pub struct GenerateShareTelemetry {
    recorder: Arc<TelemetryRecorder>,
}

impl GenerateShareTelemetry {
    pub fn new(recorder: Arc<TelemetryRecorder>) -> Self {
        Self { recorder }
    }
}

#[async_trait]
impl Stage<ExportContext> for GenerateShareTelemetry {
    fn name(&self) -> &'static str {
        "generate_share_telemetry"
    }

    async fn run(&self, ctx: ExportContext) -> Result<ExportContext> {
        let request = ShareRequest {
            dir: ShareDirection::Out,
            kind: "File".to_string(),
            items: vec![ShareItemRequest {
                kind: "Telemetry".to_string(),
                origin: self.recorder.decorator().device_id().to_string(),
                identifier: ctx.export_id.clone(),
                pkg_version: String::new(),
                transfer_count: ctx.events_count.max(0) as u64,
                size: ctx.file_size,
            }],
            env: "sdk".to_string(),
            ..Default::default()
        };
        if let Err(e) = self.recorder.capture(TelemetryRequest::Share(request)).await {
            if let Err(remove) = tokio::fs::remove_file(&ctx.destination_path).await {
                tracing::warn!(path = %ctx.destination_path.display(), error = %remove, "could not remove unrecorded export");
            }
            return Err(e);
        }
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTableService;
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: serde_json::Value) -> crate::store::Row {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_export_file_paths() {
        let dir = TempDir::new().unwrap();
        let ctx = ExportContext::new(ExportTelemetryRequest {
            destination_folder: dir.path().to_path_buf(),
        });

        let ctx = CreateExportFile::new("0123456789abcdef")
            .run(ctx)
            .await
            .unwrap();

        assert!(dir.path().join("tmp").join(&ctx.export_id).is_dir());
        let name = ctx.destination_path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("telemetry-01234567-"));
        assert!(name.ends_with(".tdb"));
        assert_eq!(
            ctx.staging_path,
            dir.path().join("tmp").join(&ctx.export_id).join(&name)
        );
        assert!(!ctx.export_id.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_only_batches_and_metadata() {
        let dir = TempDir::new().unwrap();
        let store: Arc<dyn TableService> = Arc::new(MemoryTableService::new());
        store
            .insert(InsertQuery::new("telemetry", row(json!({"event": "{}"}))))
            .await
            .unwrap();
        store
            .insert(InsertQuery::new(
                PROCESSED_TABLE,
                row(json!({"msg_id": "m1", "data": "{}", "event_count": 2, "priority": 1})),
            ))
            .await
            .unwrap();

        let ctx = ExportContext::new(ExportTelemetryRequest {
            destination_folder: dir.path().to_path_buf(),
        });
        let ctx = CreateExportFile::new("device-1").run(ctx).await.unwrap();
        let ctx = CopyDatabase::new(store.clone()).run(ctx).await.unwrap();
        let ctx = CreateMetaData::new(store.clone(), "device-1")
            .run(ctx)
            .await
            .unwrap();
        let ctx = CleanupExportedFile.run(ctx).await.unwrap();

        assert_eq!(ctx.events_count, 2);
        assert!(ctx.file_size > 0);
        assert!(!dir.path().join("tmp").exists());

        let exported = MemoryTableService::open_file(&ctx.destination_path).await.unwrap();
        let mut tables = exported.tables().await.unwrap();
        tables.sort();
        assert_eq!(tables, vec![METADATA_TABLE.to_string(), PROCESSED_TABLE.to_string()]);

        // The live store is untouched
        assert_eq!(store.tables().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_discard_staging_tolerates_missing_dir() {
        let dir = TempDir::new().unwrap();
        let staging = staging_dir(dir.path(), "export-1");
        discard_staging(&staging).await;

        tokio::fs::create_dir_all(&staging).await.unwrap();
        discard_staging(&staging).await;
        assert!(!dir.path().join("tmp").exists());
    }

    #[tokio::test]
    async fn test_discard_staging_spares_other_tmp_entries() {
        let dir = TempDir::new().unwrap();
        let tmp = dir.path().join("tmp");
        tokio::fs::create_dir_all(&tmp).await.unwrap();
        tokio::fs::write(tmp.join("notes.txt"), "keep me").await.unwrap();
        let other = staging_dir(dir.path(), "export-2");
        tokio::fs::create_dir_all(&other).await.unwrap();

        let staging = staging_dir(dir.path(), "export-1");
        tokio::fs::create_dir_all(&staging).await.unwrap();
        discard_staging(&staging).await;

        assert!(!staging.exists());
        assert!(other.is_dir());
        assert!(tmp.join("notes.txt").is_file());
    }
}
