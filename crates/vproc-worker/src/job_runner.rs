//! Single-shot job runner.
//!
//! Runs inside a compute job submitted by the admission trigger. The job
//! either carries its object locator in the environment (direct mode) or
//! claims one message from the queue itself (poll mode).

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};
use vproc_models::{JobPayload, PayloadError, VideoId};
use vproc_queue::WorkQueue;

use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::lease::{lease_job_id, LeaseRenewer};
use crate::processor::{ProcessedVideo, VideoPipeline};
use crate::resolution::{resolve, Resolution};
use crate::retry::{ErrorSeverity, StageFailure};

/// Where the runner gets its work from.
#[derive(Debug, Clone, PartialEq)]
pub enum JobSource {
    /// Object locator handed over by the trigger; no queue interaction.
    Direct(JobPayload),
    /// Claim at most one message from the queue.
    Poll,
}

impl JobSource {
    /// Direct mode when `S3_BUCKET` and `S3_KEY` are both set, poll mode otherwise.
    pub fn from_env() -> Result<Self, PayloadError> {
        let bucket = non_empty_env("S3_BUCKET");
        let key = non_empty_env("S3_KEY");

        match (bucket, key) {
            (Some(bucket), Some(key)) => Ok(JobSource::Direct(JobPayload::direct(
                bucket,
                key,
                non_empty_env("VIDEO_ID").map(VideoId::from),
                non_empty_env("MESSAGE_ID"),
            )?)),
            _ => Ok(JobSource::Poll),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Processed(ProcessedVideo),
    NoMessage,
    Failed {
        operation: String,
        severity: Option<ErrorSeverity>,
        message: String,
    },
}

impl JobOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            JobOutcome::Processed(_) | JobOutcome::NoMessage => 0,
            JobOutcome::Failed { .. } => 1,
        }
    }

    fn from_failure(failure: &StageFailure) -> Self {
        JobOutcome::Failed {
            operation: failure.operation.clone(),
            severity: Some(failure.severity),
            message: failure.error.to_string(),
        }
    }
}

pub struct JobRunner {
    config: WorkerConfig,
    pipeline: Arc<VideoPipeline>,
    queue: Option<Arc<dyn WorkQueue>>,
}

impl JobRunner {
    pub fn new(
        config: WorkerConfig,
        pipeline: Arc<VideoPipeline>,
        queue: Option<Arc<dyn WorkQueue>>,
    ) -> Self {
        Self {
            config,
            pipeline,
            queue,
        }
    }

    pub async fn run(&self, source: JobSource) -> JobOutcome {
        let outcome = match source {
            JobSource::Direct(payload) => self.run_direct(&payload).await,
            JobSource::Poll => match self.run_poll().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Job runner failed before processing: {}", e);
                    JobOutcome::Failed {
                        operation: "receive_message".to_string(),
                        severity: None,
                        message: e.to_string(),
                    }
                }
            },
        };

        let summary = self.pipeline.errors().summary();
        info!(
            exit_code = outcome.exit_code(),
            total_errors = summary.total_errors,
            most_frequent_error = summary.most_frequent_kind.as_deref().unwrap_or("none"),
            "Job finished"
        );
        outcome
    }

    async fn run_direct(&self, payload: &JobPayload) -> JobOutcome {
        info!(
            location = %payload.location.uri(),
            message_id = payload.message_id.as_deref().unwrap_or(""),
            "Processing directly assigned video"
        );

        match self.pipeline.process_payload(payload).await {
            Ok(processed) => JobOutcome::Processed(processed),
            Err(failure) => JobOutcome::from_failure(&failure),
        }
    }

    async fn run_poll(&self) -> WorkerResult<JobOutcome> {
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| WorkerError::config_error("poll mode needs a queue"))?;

        let mut messages = queue.receive(self.config.job_receive_request()).await?;
        let Some(message) = messages.pop() else {
            info!("No message available");
            return Ok(JobOutcome::NoMessage);
        };
        for extra in &messages {
            // Asked for one; anything more goes straight back.
            if let Err(e) = queue.release(&extra.receipt_handle).await {
                warn!(message_id = %extra.message_id, "Failed to release extra message: {}", e);
            }
        }

        let renewer = LeaseRenewer::new(queue.clone(), self.config.lease.clone());
        renewer
            .register(
                &message.receipt_handle,
                &lease_job_id(&message),
                Some(self.config.job_visibility_timeout),
            )
            .await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let renewer_task = renewer.spawn(shutdown_rx);

        let result = self.pipeline.process_message(&message).await;
        let resolution = resolve(
            queue.as_ref(),
            &renewer,
            self.pipeline.errors(),
            &message,
            &result,
        )
        .await;

        shutdown_tx.send_replace(true);
        if let Err(e) = renewer_task.await {
            warn!("Lease renewer task failed: {}", e);
        }

        Ok(match (result, resolution) {
            (Ok(processed), Resolution::Completed) => JobOutcome::Processed(processed),
            (Ok(_), _) => JobOutcome::Failed {
                operation: crate::resolution::RESOLVE_MESSAGE.to_string(),
                severity: None,
                message: "processed but the message could not be deleted".to_string(),
            },
            (Err(failure), _) => JobOutcome::from_failure(&failure),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{queue_message, test_pipeline, FakeAnalyzer, FakeQueue, FakeStore};
    use std::time::Duration;
    use vproc_models::VideoStatus;
    use vproc_storage::StorageError;

    #[tokio::test]
    async fn test_direct_mode_needs_no_queue() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_pipeline(dir.path(), FakeStore::ok(), FakeAnalyzer::ok());
        let runner = JobRunner::new(WorkerConfig::default(), t.pipeline.clone(), None);

        let payload = JobPayload::direct(
            "raw-videos",
            "videos/103/raw.mp4",
            Some(VideoId::from("103")),
            Some("m-1".to_string()),
        )
        .unwrap();
        let outcome = runner.run(JobSource::Direct(payload)).await;

        assert!(matches!(outcome, JobOutcome::Processed(_)));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(
            t.status.statuses(),
            vec![VideoStatus::Processing, VideoStatus::Completed]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_message_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_pipeline(dir.path(), FakeStore::ok(), FakeAnalyzer::ok());
        let queue = Arc::new(FakeQueue::default());
        let runner = JobRunner::new(WorkerConfig::default(), t.pipeline.clone(), Some(queue.clone()));

        let outcome = runner.run(JobSource::Poll).await;

        assert_eq!(outcome, JobOutcome::NoMessage);
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(queue.receive_times().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_mode_deletes_processed_message() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_pipeline(dir.path(), FakeStore::ok(), FakeAnalyzer::ok());
        let queue = Arc::new(FakeQueue::with_messages(vec![queue_message("m-1", 103)]));
        let runner = JobRunner::new(WorkerConfig::default(), t.pipeline.clone(), Some(queue.clone()));

        let outcome = runner.run(JobSource::Poll).await;

        assert!(matches!(outcome, JobOutcome::Processed(_)));
        assert_eq!(queue.deleted(), vec!["rh-m-1"]);
        // Lease requested with the job visibility window.
        assert_eq!(
            queue.visibility_calls()[0],
            ("rh-m-1".to_string(), Duration::from_secs(3600))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_exits_non_zero() {
        let dir = tempfile::tempdir().unwrap();
        let store = FakeStore::failing(1, || StorageError::not_found("videos/103/raw.mp4"));
        let t = test_pipeline(dir.path(), store, FakeAnalyzer::ok());
        let queue = Arc::new(FakeQueue::with_messages(vec![queue_message("m-1", 103)]));
        let runner = JobRunner::new(WorkerConfig::default(), t.pipeline.clone(), Some(queue.clone()));

        let outcome = runner.run(JobSource::Poll).await;

        assert_eq!(outcome.exit_code(), 1);
        match outcome {
            JobOutcome::Failed { operation, severity, .. } => {
                assert_eq!(operation, "fetch_source");
                assert_eq!(severity, Some(ErrorSeverity::Permanent));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Permanent failures are not redelivered.
        assert_eq!(queue.deleted(), vec!["rh-m-1"]);
    }

    #[tokio::test]
    async fn test_poll_mode_without_queue_fails() {
        let dir = tempfile::tempdir().unwrap();
        let t = test_pipeline(dir.path(), FakeStore::ok(), FakeAnalyzer::ok());
        let runner = JobRunner::new(WorkerConfig::default(), t.pipeline.clone(), None);

        let outcome = runner.run(JobSource::Poll).await;
        assert_eq!(outcome.exit_code(), 1);
    }
}
