use opentelemetry_sdk::error::OTelSdkError;
use thiserror::Error;

/// Errors raised while configuring or installing telemetry.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Exporter error: {0}")]
    Exporter(String),
    #[error("Initialization error: {0}")]
    Init(String),
}

impl From<OTelSdkError> for TelemetryError {
    fn from(err: OTelSdkError) -> Self {
        Self::Exporter(err.to_string())
    }
}

impl From<ExportError> for TelemetryError {
    fn from(err: ExportError) -> Self {
        Self::Exporter(err.to_string())
    }
}

/// Errors raised on the export path, from conversion down to the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Connection, timeout or body error from the HTTP client
    #[error("http error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Ingest answered with a status that will not succeed on retry
    #[error("rejected by ingest ({status}): {reason}")]
    Rejected { status: u16, reason: String },
    #[error("all retry attempts exhausted after {attempts} tries: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// A single record exceeds the ingest payload limit
    #[error("payload too large to send even as a single record")]
    PayloadTooLarge,
    #[error("send queue is full")]
    QueueFull,
    #[error("exporter is closed")]
    Closed,
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl ExportError {
    /// Whether a retry might change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http(_) | Self::RetriesExhausted { .. } | Self::QueueFull
        )
    }
}

impl From<ExportError> for OTelSdkError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::Closed => OTelSdkError::AlreadyShutdown,
            other => OTelSdkError::InternalFailure(other.to_string()),
        }
    }
}

/// Converts a join error from a spawned delivery task.
pub(crate) fn runtime_error(err: tokio::task::JoinError) -> ExportError {
    ExportError::Runtime(err.to_string())
}
