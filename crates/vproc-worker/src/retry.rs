//! Error classification and retry with exponential backoff.
//!
//! Every failure is mapped to an [`ErrorSeverity`] tier. Only temporary
//! failures are retried; permanent and system-fatal ones return after a
//! single attempt so the caller can resolve the message immediately.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use vproc_queue::QueueError;
use vproc_storage::StorageError;

use crate::error::WorkerError;

/// Remote error codes worth retrying.
const TEMPORARY_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailable",
    "RequestTimeout",
    "InternalError",
];

/// Remote error codes that will fail the same way on every attempt.
const PERMANENT_CODES: &[&str] = &[
    "AccessDenied",
    "NoSuchKey",
    "NoSuchBucket",
    "InvalidAccessKeyId",
    "NotFound",
];

// errno values meaning the host itself is in trouble.
const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
const ENOSPC: i32 = 28;

/// How a failure should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Likely to succeed on retry.
    Temporary,
    /// Will fail identically on every retry.
    Permanent,
    /// The worker itself is unhealthy; needs an operator.
    SystemFatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorSeverity::Temporary => "temporary",
            ErrorSeverity::Permanent => "permanent",
            ErrorSeverity::SystemFatal => "system_fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorSeverity::Temporary)
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify an error into a severity tier.
///
/// The error kind decides first, then the remote error code. Anything
/// unrecognized is treated as temporary.
pub fn classify(error: &WorkerError) -> ErrorSeverity {
    if let Some(severity) = classify_kind(error) {
        return severity;
    }
    if let Some(severity) = error.service_code().and_then(classify_code) {
        return severity;
    }
    ErrorSeverity::Temporary
}

/// Severity implied by a remote error code, if the code is known.
pub fn classify_code(code: &str) -> Option<ErrorSeverity> {
    if TEMPORARY_CODES.contains(&code) {
        Some(ErrorSeverity::Temporary)
    } else if PERMANENT_CODES.contains(&code) {
        Some(ErrorSeverity::Permanent)
    } else {
        None
    }
}

fn classify_kind(error: &WorkerError) -> Option<ErrorSeverity> {
    match error {
        WorkerError::ConfigError(_) | WorkerError::Payload(_) | WorkerError::Json(_) => {
            Some(ErrorSeverity::Permanent)
        }
        WorkerError::ResourceExhausted(_) => Some(ErrorSeverity::SystemFatal),
        WorkerError::AnalysisTimeout(_) => Some(ErrorSeverity::Temporary),
        WorkerError::AnalysisFailed { .. } => None,
        WorkerError::StatusRejected { status, .. } => Some(classify_http_status(*status)),
        WorkerError::Io(e) => classify_io(e),
        WorkerError::Http(e) => classify_http(e),
        WorkerError::Storage(e) => match e {
            StorageError::Network { .. } => Some(ErrorSeverity::Temporary),
            StorageError::NotFound(_)
            | StorageError::InvalidKey(_)
            | StorageError::ConfigError(_) => Some(ErrorSeverity::Permanent),
            StorageError::Io(io) => classify_io(io),
            StorageError::Service { .. } => None,
        },
        WorkerError::Queue(e) => match e {
            QueueError::Network { .. } => Some(ErrorSeverity::Temporary),
            QueueError::ConfigError(_) | QueueError::InvalidMessage(_) | QueueError::Json(_) => {
                Some(ErrorSeverity::Permanent)
            }
            QueueError::Service { .. } => None,
        },
    }
}

fn classify_io(error: &io::Error) -> Option<ErrorSeverity> {
    if let Some(code) = error.raw_os_error() {
        if matches!(code, ENOMEM | ENFILE | EMFILE | ENOSPC) {
            return Some(ErrorSeverity::SystemFatal);
        }
    }

    match error.kind() {
        io::ErrorKind::OutOfMemory => Some(ErrorSeverity::SystemFatal),
        io::ErrorKind::NotFound
        | io::ErrorKind::PermissionDenied
        | io::ErrorKind::InvalidInput
        | io::ErrorKind::InvalidData
        | io::ErrorKind::Unsupported => Some(ErrorSeverity::Permanent),
        io::ErrorKind::TimedOut
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::UnexpectedEof => Some(ErrorSeverity::Temporary),
        _ => None,
    }
}

fn classify_http(error: &reqwest::Error) -> Option<ErrorSeverity> {
    if error.is_timeout() || error.is_connect() {
        return Some(ErrorSeverity::Temporary);
    }
    if error.is_builder() {
        return Some(ErrorSeverity::Permanent);
    }
    error.status().map(|s| classify_http_status(s.as_u16()))
}

fn classify_http_status(status: u16) -> ErrorSeverity {
    match status {
        408 | 429 => ErrorSeverity::Temporary,
        400..=499 => ErrorSeverity::Permanent,
        _ => ErrorSeverity::Temporary,
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            base_delay: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            multiplier: std::env::var("RETRY_MULTIPLIER")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|m: &f64| *m >= 1.0)
                .unwrap_or(defaults.multiplier),
            max_delay: std::env::var("RETRY_MAX_DELAY_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_delay),
        }
    }

    /// Delay after the given failed attempt (1-based).
    ///
    /// `min(base * multiplier^(attempt-1), max_delay)`: non-decreasing in
    /// `attempt` and never above `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

/// Receives every failed attempt of a retried operation.
pub trait RetryObserver: Send + Sync {
    fn on_failure(&self, error: &WorkerError, operation: &str, attempt: u32);
}

/// Observer that ignores failures.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl RetryObserver for NoObserver {
    fn on_failure(&self, _error: &WorkerError, _operation: &str, _attempt: u32) {}
}

/// Final failure of a retried operation.
#[derive(Debug, Error)]
#[error("{operation} failed after {attempts} attempt(s) [{severity}]: {error}")]
pub struct StageFailure {
    pub operation: String,
    pub severity: ErrorSeverity,
    pub attempts: u32,
    #[source]
    pub error: WorkerError,
}

impl StageFailure {
    /// Wrap an error that never went through a retry loop.
    pub fn immediate(operation: impl Into<String>, error: WorkerError) -> Self {
        Self {
            operation: operation.into(),
            severity: classify(&error),
            attempts: 1,
            error,
        }
    }
}

/// Run an async operation, retrying temporary failures with backoff.
///
/// Permanent and system-fatal failures return after the attempt that
/// produced them. Temporary failures are retried until `max_attempts`
/// attempts have been made; the last error is returned.
///
/// # Example
/// ```ignore
/// let data = retry_with_backoff(&policy, 3, "fetch_source", &NoObserver, || async {
///     store.download_to(&location, &path).await.map_err(WorkerError::from)
/// })
/// .await?;
/// ```
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    max_attempts: u32,
    operation: &str,
    observer: &dyn RetryObserver,
    mut f: F,
) -> Result<T, StageFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, WorkerError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let error = match f().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let severity = classify(&error);
        observer.on_failure(&error, operation, attempt);

        if !severity.is_retryable() || attempt >= max_attempts {
            warn!(
                operation,
                attempt,
                max_attempts,
                severity = %severity,
                "Operation failed: {}", error
            );
            return Err(StageFailure {
                operation: operation.to_string(),
                severity,
                attempts: attempt,
                error,
            });
        }

        let delay = policy.delay(attempt);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Temporary failure, retrying: {}", error
        );
        tokio::time::sleep(delay).await;
    }
}

/// State tracker for repeated operations that may fail intermittently.
///
/// Useful for background loops (like queue polling) that run continuously
/// and should suppress log spam after repeated failures.
#[derive(Debug, Default)]
pub struct FailureTracker {
    consecutive_failures: u32,
    max_logged_failures: u32,
    suppressed: bool,
}

impl FailureTracker {
    /// Create a new failure tracker.
    pub fn new(max_logged_failures: u32) -> Self {
        Self {
            consecutive_failures: 0,
            max_logged_failures,
            suppressed: false,
        }
    }

    /// Record a successful operation (resets failure count).
    pub fn record_success(&mut self) {
        if self.consecutive_failures > 0 && self.suppressed {
            debug!(
                "Operation recovered after {} consecutive failures",
                self.consecutive_failures
            );
        }
        self.consecutive_failures = 0;
        self.suppressed = false;
    }

    /// Record a failed operation.
    ///
    /// Returns `true` if this failure should be logged (not suppressed).
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;

        if self.consecutive_failures <= self.max_logged_failures {
            true
        } else if self.consecutive_failures == self.max_logged_failures + 1 {
            self.suppressed = true;
            warn!(
                "Suppressing further failure logs after {} consecutive failures",
                self.max_logged_failures
            );
            false
        } else {
            false
        }
    }

    /// Get the current consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.consecutive_failures
    }
}
