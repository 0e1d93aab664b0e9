//! Trigger error types.

use aws_sdk_batch::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use thiserror::Error;

pub type TriggerResult<T> = Result<T, TriggerError>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Scheduler {operation} failed ({}): {message}", .code.as_deref().unwrap_or("unknown"))]
    Scheduler {
        operation: &'static str,
        code: Option<String>,
        message: String,
    },

    #[error("Invalid payload: {0}")]
    Payload(#[from] vproc_models::PayloadError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TriggerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn scheduler(operation: &'static str, msg: impl Into<String>) -> Self {
        Self::Scheduler {
            operation,
            code: None,
            message: msg.into(),
        }
    }

    pub(crate) fn from_sdk<E, R>(operation: &'static str, err: SdkError<E, R>) -> Self
    where
        E: ProvideErrorMetadata + std::error::Error + 'static,
        R: std::fmt::Debug,
    {
        Self::Scheduler {
            operation,
            code: err.code().map(str::to_string),
            message: err
                .message()
                .map(str::to_string)
                .unwrap_or_else(|| DisplayErrorContext(&err).to_string()),
        }
    }
}
