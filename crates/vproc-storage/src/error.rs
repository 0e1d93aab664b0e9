//! Storage error types.

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to configure storage client: {0}")]
    ConfigError(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    /// The request never got a response, or the body stream broke off.
    #[error("Network error during {operation}: {message}")]
    Network {
        operation: &'static str,
        message: String,
    },

    /// S3 answered with an error.
    #[error("S3 {operation} failed ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Service {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound(key.into())
    }

    pub fn network(operation: &'static str, msg: impl Into<String>) -> Self {
        Self::Network {
            operation,
            message: msg.into(),
        }
    }

    /// Remote error code (`NoSuchKey`, `AccessDenied`, `SlowDown`, ...).
    pub fn code(&self) -> Option<&str> {
        match self {
            StorageError::NotFound(_) => Some("NoSuchKey"),
            StorageError::Service { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    /// True for failures that never reached the service.
    pub fn is_network(&self) -> bool {
        matches!(self, StorageError::Network { .. })
    }

    pub(crate) fn from_sdk<E, R>(operation: &'static str, key: &str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => Self::Network {
                operation,
                message: DisplayErrorContext(&err).to_string(),
            },
            _ => match err.code() {
                Some("NoSuchKey") | Some("NotFound") => Self::not_found(key),
                code => Self::Service {
                    operation,
                    code: code.map(str::to_string),
                    message: err
                        .message()
                        .map(str::to_string)
                        .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
                },
            },
        }
    }
}
