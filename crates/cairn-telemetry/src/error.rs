//! Error types for telemetry operations.

use thiserror::Error;

/// Errors surfaced by the telemetry service and its pipelines.
#[derive(Error, Debug)]
pub enum TelemetryError {
    /// Raw telemetry or a stored row could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// A capture request or an imported file failed validation
    #[error("validation failed: {0}")]
    Validation(String),

    /// A batch could not be delivered to the collector
    #[error("transport error: {0}")]
    Transport(String),

    /// The collector answered with a non-success status
    #[error("collector rejected batch with status {status}")]
    Rejected { status: u16 },

    /// The table service failed
    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    /// A pipeline stage failed
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<TelemetryError>,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TelemetryError {
    /// Wrap a collaborator failure as a store error.
    pub fn store(err: impl Into<anyhow::Error>) -> Self {
        TelemetryError::Store(err.into())
    }

    /// Whether the failure came from talking to the collector.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            TelemetryError::Transport(_) | TelemetryError::Rejected { .. }
        )
    }
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;
