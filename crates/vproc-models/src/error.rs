//! Payload validation errors.

use thiserror::Error;

pub type PayloadResult<T> = Result<T, PayloadError>;

/// Errors raised while turning a queue message body into a [`crate::JobPayload`].
///
/// All variants describe a defect in the message itself, so redelivering the
/// same body can never succeed.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unsupported event type: {0}")]
    UnsupportedEvent(String),
}

impl PayloadError {
    pub fn invalid_field(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
