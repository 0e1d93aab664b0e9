//! Worker error types.

use std::time::Duration;

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid payload: {0}")]
    Payload(#[from] vproc_models::PayloadError),

    #[error("Analysis failed (exit code {}): {message}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()))]
    AnalysisFailed {
        exit_code: Option<i32>,
        message: String,
    },

    #[error("Analysis timed out after {0:?}")]
    AnalysisTimeout(Duration),

    /// The host ran out of a resource (memory, disk, descriptors).
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Status update rejected ({status}): {message}")]
    StatusRejected { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] vproc_storage::StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] vproc_queue::QueueError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn analysis_failed(exit_code: Option<i32>, msg: impl Into<String>) -> Self {
        Self::AnalysisFailed {
            exit_code,
            message: msg.into(),
        }
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        Self::ResourceExhausted(msg.into())
    }

    /// Short stable name of the error kind, used as an aggregation key.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerError::ConfigError(_) => "config",
            WorkerError::Payload(_) => "payload",
            WorkerError::AnalysisFailed { .. } => "analysis_failed",
            WorkerError::AnalysisTimeout(_) => "analysis_timeout",
            WorkerError::ResourceExhausted(_) => "resource_exhausted",
            WorkerError::StatusRejected { .. } => "status_rejected",
            WorkerError::Storage(_) => "storage",
            WorkerError::Queue(_) => "queue",
            WorkerError::Http(_) => "http",
            WorkerError::Json(_) => "json",
            WorkerError::Io(_) => "io",
        }
    }

    /// Structured remote error code, when the failing service returned one.
    pub fn service_code(&self) -> Option<&str> {
        match self {
            WorkerError::Storage(e) => e.code(),
            WorkerError::Queue(e) => e.code(),
            _ => None,
        }
    }
}
