//! Trigger configuration.

use crate::error::{TriggerError, TriggerResult};

/// Admission trigger configuration.
#[derive(Debug, Clone)]
pub struct TriggerConfig {
    /// Compute job queue to submit into
    pub job_queue: String,
    /// Job definition for analysis jobs
    pub job_definition: String,
    /// Maximum number of active jobs in the queue
    pub max_concurrent_jobs: usize,
}

impl TriggerConfig {
    pub fn new(job_queue: impl Into<String>, job_definition: impl Into<String>) -> Self {
        Self {
            job_queue: job_queue.into(),
            job_definition: job_definition.into(),
            max_concurrent_jobs: 1,
        }
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Create config from environment variables.
    pub fn from_env() -> TriggerResult<Self> {
        let job_queue = std::env::var("BATCH_JOB_QUEUE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| TriggerError::config_error("BATCH_JOB_QUEUE not set"))?;
        let job_definition = std::env::var("BATCH_JOB_DEFINITION")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| TriggerError::config_error("BATCH_JOB_DEFINITION not set"))?;

        Ok(Self {
            job_queue,
            job_definition,
            max_concurrent_jobs: std::env::var("MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1),
        })
    }
}
