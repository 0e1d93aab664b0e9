//! Queue error types.

use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The request never got a response (connect failure, timeout).
    #[error("Network error during {operation}: {message}")]
    Network {
        operation: &'static str,
        message: String,
    },

    /// The service answered with an error.
    #[error("SQS {operation} failed ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Service {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }

    /// Structured service error code, when the service returned one.
    pub fn code(&self) -> Option<&str> {
        match self {
            QueueError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True for failures that never reached the service.
    pub fn is_network(&self) -> bool {
        matches!(self, QueueError::Network { .. })
    }

    pub(crate) fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Self::Network {
                operation,
                message: DisplayErrorContext(&err).to_string(),
            },
            _ => Self::Service {
                operation,
                code: err.code().map(str::to_string),
                message: err
                    .message()
                    .map(str::to_string)
                    .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
            },
        }
    }
}
