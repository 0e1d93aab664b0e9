//! Video analysis worker.
//!
//! This crate provides:
//! - Error classification and stage retry with backoff
//! - Lease renewal for in-flight queue messages
//! - The per-message analysis pipeline and its collaborator seams
//! - A long-running worker loop and a single-shot job runner
//! - Error accounting, metrics and graceful shutdown

pub mod analyzer;
pub mod config;
pub mod error;
pub mod error_tracker;
pub mod executor;
pub mod job_runner;
pub mod lease;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod resolution;
pub mod results;
pub mod retry;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

pub use analyzer::{AnalysisOutput, AnalysisRequest, AnalyzerConfig, CommandAnalyzer, VideoAnalyzer};
pub use config::{StageAttempts, WorkerConfig};
pub use error::{WorkerError, WorkerResult};
pub use error_tracker::{ErrorRecord, ErrorStats, ErrorSummary, ErrorTracker};
pub use executor::{WorkerLoop, WorkerReport};
pub use job_runner::{JobOutcome, JobRunner, JobSource};
pub use lease::{lease_job_id, Lease, LeaseConfig, LeaseRenewer, LeaseStats, LeaseStatus};
pub use logging::{init_tracing, JobLogger};
pub use processor::{ProcessedVideo, VideoPipeline};
pub use resolution::Resolution;
pub use results::{LocalResultStore, ResultStore};
pub use retry::{classify, retry_with_backoff, ErrorSeverity, RetryPolicy, StageFailure};
pub use status::{status_reporter_from_env, HttpStatusReporter, LogStatusReporter, StatusReporter};
