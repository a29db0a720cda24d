//! Export manifest
//!
//! Written into the `metadata` table of every exported file as one
//! `{key, value}` row per field. Import refuses files whose manifest is
//! missing, from a newer format, not a telemetry export, or whose checksum
//! does not match the batches it ships with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, TelemetryError};
use crate::schema::ProcessedBatch;
use crate::store::{Row, StoredRow};

/// Current export format version
pub const EXPORT_FORMAT_VERSION: u32 = 20;

/// Content type carried by telemetry exports
pub const EXPORT_TYPE_TELEMETRY: &str = "telemetry";

/// Extension of exported telemetry files
pub const EXPORT_FILE_EXTENSION: &str = "tdb";

pub const COLUMN_KEY: &str = "key";
pub const COLUMN_VALUE: &str = "value";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportManifest {
    /// Export format version
    pub version: u32,

    /// Content types present in the file
    pub types: Vec<String>,

    /// Exporting device
    pub did: String,

    pub export_id: String,

    /// Events across all shipped batches
    pub events_count: i64,

    pub exported_at: DateTime<Utc>,

    /// Hex SHA-256 over batch payloads in offset order
    pub checksum: String,
}

impl ExportManifest {
    pub fn new(
        did: impl Into<String>,
        export_id: impl Into<String>,
        batches: &[ProcessedBatch],
    ) -> Self {
        Self {
            version: EXPORT_FORMAT_VERSION,
            types: vec![EXPORT_TYPE_TELEMETRY.to_string()],
            did: did.into(),
            export_id: export_id.into(),
            events_count: batches.iter().map(|b| b.event_count).sum(),
            exported_at: Utc::now(),
            checksum: payload_checksum(batches),
        }
    }

    /// One metadata row per field
    pub fn to_rows(&self) -> Result<Vec<Row>> {
        let Value::Object(fields) = serde_json::to_value(self)? else {
            return Err(TelemetryError::Parse("manifest is not an object".to_string()));
        };

        Ok(fields
            .into_iter()
            .filter_map(|(key, value)| match json!({ COLUMN_KEY: key, COLUMN_VALUE: value }) {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect())
    }

    /// Rebuild the manifest from metadata rows
    pub fn from_rows(rows: &[StoredRow]) -> Result<Self> {
        if rows.is_empty() {
            return Err(TelemetryError::Validation(
                "file carries no export metadata".to_string(),
            ));
        }

        let mut fields = serde_json::Map::new();
        for stored in rows {
            let key = stored
                .row
                .get(COLUMN_KEY)
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    TelemetryError::Validation(format!("metadata row {} has no key", stored.offset))
                })?;
            let value = stored.row.get(COLUMN_VALUE).cloned().unwrap_or(Value::Null);
            fields.insert(key.to_string(), value);
        }

        serde_json::from_value(Value::Object(fields))
            .map_err(|e| TelemetryError::Validation(format!("unreadable export metadata: {e}")))
    }

    /// Check the manifest describes a telemetry export this build can read
    pub fn validate(&self) -> Result<()> {
        if !self.types.iter().any(|t| t == EXPORT_TYPE_TELEMETRY) {
            return Err(TelemetryError::Validation(format!(
                "export types {:?} do not include telemetry",
                self.types
            )));
        }
        if self.version > EXPORT_FORMAT_VERSION {
            return Err(TelemetryError::Validation(format!(
                "export format {} is newer than supported {}",
                self.version, EXPORT_FORMAT_VERSION
            )));
        }
        Ok(())
    }

    /// Check the shipped batches against the recorded checksum
    pub fn verify(&self, batches: &[ProcessedBatch]) -> Result<()> {
        let actual = payload_checksum(batches);
        if actual != self.checksum {
            return Err(TelemetryError::Validation(format!(
                "checksum mismatch: manifest {}, batches {}",
                self.checksum, actual
            )));
        }
        Ok(())
    }
}

/// Hex SHA-256 over length-prefixed batch payloads, in the order given
pub fn payload_checksum(batches: &[ProcessedBatch]) -> String {
    let mut hasher = Sha256::new();
    for batch in batches {
        hasher.update((batch.data.len() as u64).to_le_bytes());
        hasher.update(batch.data.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(data: &str, event_count: i64) -> ProcessedBatch {
        ProcessedBatch {
            offset: 0,
            msg_id: format!("msg-{data}"),
            data: data.to_string(),
            event_count,
            priority: 1,
        }
    }

    fn stored(rows: Vec<Row>) -> Vec<StoredRow> {
        rows.into_iter()
            .enumerate()
            .map(|(i, row)| StoredRow {
                offset: i as i64 + 1,
                row,
            })
            .collect()
    }

    #[test]
    fn test_manifest_survives_metadata_rows() {
        let batches = vec![batch("a", 3), batch("b", 2)];
        let manifest = ExportManifest::new("device-1", "export-1", &batches);
        assert_eq!(manifest.events_count, 5);

        let rows = stored(manifest.to_rows().unwrap());
        assert_eq!(rows.len(), 7);

        let read = ExportManifest::from_rows(&rows).unwrap();
        assert_eq!(read, manifest);
        read.validate().unwrap();
        read.verify(&batches).unwrap();
    }

    #[test]
    fn test_checksum_depends_on_order() {
        let forward = payload_checksum(&[batch("a", 1), batch("b", 1)]);
        let reverse = payload_checksum(&[batch("b", 1), batch("a", 1)]);
        assert_ne!(forward, reverse);
        assert_eq!(forward.len(), 64);
    }

    #[test]
    fn test_checksum_keeps_payload_boundaries() {
        let split_late = payload_checksum(&[batch("ab", 1), batch("c", 1)]);
        let split_early = payload_checksum(&[batch("a", 1), batch("bc", 1)]);
        assert_ne!(split_late, split_early);
    }

    #[test]
    fn test_newer_format_is_rejected() {
        let mut manifest = ExportManifest::new("d", "e", &[]);
        manifest.version = EXPORT_FORMAT_VERSION + 1;
        assert!(matches!(manifest.validate(), Err(TelemetryError::Validation(_))));
    }

    #[test]
    fn test_non_telemetry_export_is_rejected() {
        let mut manifest = ExportManifest::new("d", "e", &[]);
        manifest.types = vec!["content".to_string()];
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_tampered_batches_fail_verification() {
        let manifest = ExportManifest::new("d", "e", &[batch("a", 1)]);
        assert!(manifest.verify(&[batch("z", 1)]).is_err());
    }

    #[test]
    fn test_empty_metadata_is_rejected() {
        assert!(matches!(
            ExportManifest::from_rows(&[]),
            Err(TelemetryError::Validation(_))
        ));
    }
}
