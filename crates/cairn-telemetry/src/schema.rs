//! Table layout of the local event store

use serde_json::{json, Value};

use crate::decorator::PreparedEvent;
use crate::error::{Result, TelemetryError};
use crate::store::{Row, StoredRow};

/// Raw decorated events awaiting packing
pub const TELEMETRY_TABLE: &str = "telemetry";
/// Packed batches awaiting upload
pub const PROCESSED_TABLE: &str = "processed_telemetry";
/// Export manifest, present only in exported files
pub const METADATA_TABLE: &str = "metadata";
/// Bookkeeping of files already imported
pub const IMPORTED_METADATA_TABLE: &str = "imported_metadata";

pub const COLUMN_EVENT: &str = "event";
pub const COLUMN_EVENT_TYPE: &str = "event_type";
pub const COLUMN_TIMESTAMP: &str = "timestamp";
pub const COLUMN_PRIORITY: &str = "priority";
pub const COLUMN_MSG_ID: &str = "msg_id";
pub const COLUMN_DATA: &str = "data";
pub const COLUMN_NUMBER_OF_EVENTS: &str = "event_count";
pub const COLUMN_IMPORTED_ID: &str = "imported_id";
pub const COLUMN_DEVICE_ID: &str = "device_id";
pub const COLUMN_COUNT: &str = "count";
pub const COLUMN_IMPORTED_AT: &str = "imported_at";

fn object(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

fn str_column(stored: &StoredRow, table: &str, column: &str) -> Result<String> {
    stored
        .row
        .get(column)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            TelemetryError::Parse(format!(
                "{table} row {} has no text column '{column}'",
                stored.offset
            ))
        })
}

fn int_column(stored: &StoredRow, table: &str, column: &str) -> Result<i64> {
    stored
        .row
        .get(column)
        .and_then(Value::as_i64)
        .ok_or_else(|| {
            TelemetryError::Parse(format!(
                "{table} row {} has no integer column '{column}'",
                stored.offset
            ))
        })
}

impl PreparedEvent {
    pub fn to_row(&self) -> Row {
        object(json!({
            COLUMN_EVENT: self.event,
            COLUMN_EVENT_TYPE: self.event_type.as_str(),
            COLUMN_TIMESTAMP: self.timestamp,
            COLUMN_PRIORITY: self.priority,
        }))
    }
}

/// Row of the raw event table
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    pub offset: i64,
    pub event: String,
    pub priority: i64,
}

impl RawEvent {
    pub fn from_stored(stored: &StoredRow) -> Result<Self> {
        Ok(Self {
            offset: stored.offset,
            event: str_column(stored, TELEMETRY_TABLE, COLUMN_EVENT)?,
            priority: stored
                .row
                .get(COLUMN_PRIORITY)
                .and_then(Value::as_i64)
                .unwrap_or(1),
        })
    }
}

/// Row of the processed batch table
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedBatch {
    pub offset: i64,
    pub msg_id: String,
    /// Serialized batch payload
    pub data: String,
    pub event_count: i64,
    pub priority: i64,
}

impl ProcessedBatch {
    pub fn from_stored(stored: &StoredRow) -> Result<Self> {
        Ok(Self {
            offset: stored.offset,
            msg_id: str_column(stored, PROCESSED_TABLE, COLUMN_MSG_ID)?,
            data: str_column(stored, PROCESSED_TABLE, COLUMN_DATA)?,
            event_count: int_column(stored, PROCESSED_TABLE, COLUMN_NUMBER_OF_EVENTS)?,
            priority: stored
                .row
                .get(COLUMN_PRIORITY)
                .and_then(Value::as_i64)
                .unwrap_or(1),
        })
    }

    pub fn to_row(&self) -> Row {
        object(json!({
            COLUMN_MSG_ID: self.msg_id,
            COLUMN_DATA: self.data,
            COLUMN_NUMBER_OF_EVENTS: self.event_count,
            COLUMN_PRIORITY: self.priority,
        }))
    }
}

/// Row recording one imported export
#[derive(Debug, Clone, PartialEq)]
pub struct ImportedMetadata {
    pub imported_id: String,
    pub device_id: String,
    pub count: i64,
    pub imported_at: i64,
}

impl ImportedMetadata {
    pub fn to_row(&self) -> Row {
        object(json!({
            COLUMN_IMPORTED_ID: self.imported_id,
            COLUMN_DEVICE_ID: self.device_id,
            COLUMN_COUNT: self.count,
            COLUMN_IMPORTED_AT: self.imported_at,
        }))
    }
}
