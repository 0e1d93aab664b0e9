//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

use vproc_queue::ReceiveRequest;

use crate::lease::LeaseConfig;
use crate::retry::RetryPolicy;

/// Attempts allowed per pipeline stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAttempts {
    pub parse: u32,
    pub fetch: u32,
    pub analyze: u32,
    pub persist: u32,
    pub status: u32,
}

impl Default for StageAttempts {
    fn default() -> Self {
        Self {
            parse: 1,
            fetch: 3,
            analyze: 2,
            persist: 3,
            status: 3,
        }
    }
}

impl StageAttempts {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            parse: defaults.parse,
            fetch: env_or("STAGE_FETCH_ATTEMPTS", defaults.fetch),
            analyze: env_or("STAGE_ANALYZE_ATTEMPTS", defaults.analyze),
            persist: env_or("STAGE_PERSIST_ATTEMPTS", defaults.persist),
            status: env_or("STAGE_STATUS_ATTEMPTS", defaults.status),
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Work directory for downloaded sources
    pub work_dir: PathBuf,
    /// Directory receiving per-video result files
    pub results_dir: PathBuf,
    /// Long-poll wait per receive call
    pub wait_time: Duration,
    /// Visibility window requested when a message is received
    pub visibility_timeout: Duration,
    /// Visibility window requested by the single-shot job runner
    pub job_visibility_timeout: Duration,
    /// Consecutive empty polls before pausing
    pub max_empty_polls: u32,
    /// Pause after `max_empty_polls` empty polls
    pub idle_pause: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
    /// Stage retry backoff
    pub retry: RetryPolicy,
    /// Stage retry limits
    pub stages: StageAttempts,
    /// Lease renewal
    pub lease: LeaseConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("/tmp/vproc"),
            results_dir: PathBuf::from("/tmp/vproc/results"),
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(300),
            job_visibility_timeout: Duration::from_secs(3600), // 1 hour
            max_empty_polls: 3,
            idle_pause: Duration::from_secs(30),
            error_backoff: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            stages: StageAttempts::default(),
            lease: LeaseConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            work_dir: std::env::var("WORKER_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            results_dir: std::env::var("WORKER_RESULTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.results_dir),
            wait_time: Duration::from_secs(env_or("WORKER_WAIT_TIME_SECS", 20).min(20)),
            visibility_timeout: Duration::from_secs(env_or("WORKER_VISIBILITY_TIMEOUT_SECS", 300)),
            job_visibility_timeout: Duration::from_secs(env_or(
                "JOB_VISIBILITY_TIMEOUT_SECS",
                3600,
            )),
            max_empty_polls: env_or("WORKER_MAX_EMPTY_POLLS", defaults.max_empty_polls).max(1),
            idle_pause: Duration::from_secs(env_or("WORKER_IDLE_PAUSE_SECS", 30)),
            error_backoff: Duration::from_secs(env_or("WORKER_ERROR_BACKOFF_SECS", 10)),
            retry: RetryPolicy::from_env(),
            stages: StageAttempts::from_env(),
            lease: LeaseConfig::from_env(),
        }
    }

    /// Receive parameters for the long-running loop.
    ///
    /// One message per call: only the message being processed holds a lease.
    pub fn receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: 1,
            wait_time: self.wait_time,
            visibility_timeout: self.visibility_timeout,
        }
    }

    /// Receive parameters for the single-shot job runner.
    pub fn job_receive_request(&self) -> ReceiveRequest {
        ReceiveRequest {
            max_messages: 1,
            wait_time: self.wait_time,
            visibility_timeout: self.job_visibility_timeout,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}
