//! Final disposition of a processed message.
//!
//! Successful and non-retryable messages are deleted; temporary failures
//! are released back to the queue for another consumer. Whatever happens,
//! the message's lease leaves the ledger.

use tracing::{error, info, warn};
use vproc_queue::{QueueMessage, WorkQueue};

use crate::error_tracker::ErrorTracker;
use crate::lease::{LeaseRenewer, LeaseStatus};
use crate::metrics;
use crate::processor::ProcessedVideo;
use crate::retry::{ErrorSeverity, StageFailure};

/// Operation label for resolution failures in the error tracker.
pub const RESOLVE_MESSAGE: &str = "resolve_message";

/// What happened to a message after processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Processed and deleted.
    Completed,
    /// Failed without hope of retry and deleted.
    Discarded { severity: ErrorSeverity },
    /// Failed temporarily and made visible again.
    Released,
    /// The queue call that should have resolved it failed.
    Unresolved { severity: Option<ErrorSeverity> },
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Completed => "completed",
            Resolution::Discarded { .. } => "discarded",
            Resolution::Released => "released",
            Resolution::Unresolved { .. } => "unresolved",
        }
    }

    /// Severity of the processing failure, if processing failed.
    pub fn severity(&self) -> Option<ErrorSeverity> {
        match self {
            Resolution::Completed => None,
            Resolution::Discarded { severity } => Some(*severity),
            Resolution::Released => Some(ErrorSeverity::Temporary),
            Resolution::Unresolved { severity } => *severity,
        }
    }
}

/// Apply the resolution policy to a processed message.
pub async fn resolve(
    queue: &dyn WorkQueue,
    renewer: &LeaseRenewer,
    errors: &ErrorTracker,
    message: &QueueMessage,
    outcome: &Result<ProcessedVideo, StageFailure>,
) -> Resolution {
    let handle = message.receipt_handle.as_str();
    let message_id = message.message_id.as_str();

    let (severity, lease_status) = match outcome {
        Ok(_) => (None, LeaseStatus::Completed),
        Err(failure) => (Some(failure.severity), LeaseStatus::Failed),
    };

    // Stop renewing before the queue call so no extension lands after it.
    renewer.finish(handle, lease_status).await;

    let queue_result = match outcome {
        Err(failure) if failure.severity.is_retryable() => queue.release(handle).await,
        Err(failure) => {
            if failure.severity == ErrorSeverity::SystemFatal {
                error!(
                    message_id,
                    operation = %failure.operation,
                    "System-fatal failure, operator attention required: {}", failure.error
                );
            }
            queue.delete(handle).await
        }
        Ok(_) => queue.delete(handle).await,
    };

    let resolution = match queue_result {
        Ok(()) => match severity {
            None => Resolution::Completed,
            Some(ErrorSeverity::Temporary) => Resolution::Released,
            Some(severity) => Resolution::Discarded { severity },
        },
        Err(e) => {
            error!(message_id, "Failed to resolve message: {}", e);
            errors.record_raw("queue", &e.to_string(), message_id, RESOLVE_MESSAGE);

            if let Err(release_err) = queue.release(handle).await {
                warn!(message_id, "Best-effort release failed: {}", release_err);
            }
            Resolution::Unresolved { severity }
        }
    };

    metrics::record_message_processed(resolution.as_str());
    info!(message_id, resolution = resolution.as_str(), "Message resolved");
    resolution
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::WorkerError;
    use crate::lease::LeaseConfig;
    use crate::testing::{queue_message, FakeQueue};
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;
    use vproc_models::VideoId;

    fn processed() -> Result<ProcessedVideo, StageFailure> {
        Ok(ProcessedVideo {
            video_id: VideoId::from("103"),
            result_path: PathBuf::from("/results/103.json"),
            analysis_duration: Duration::from_secs(1),
            bytes_fetched: 11,
        })
    }

    fn failed(error: WorkerError) -> Result<ProcessedVideo, StageFailure> {
        Err(StageFailure::immediate("fetch_source", error))
    }

    async fn setup() -> (Arc<FakeQueue>, LeaseRenewer, ErrorTracker, QueueMessage) {
        let queue = Arc::new(FakeQueue::default());
        let renewer = LeaseRenewer::new(queue.clone(), LeaseConfig::default());
        let message = queue_message("m-1", 103);
        renewer.register(&message.receipt_handle, "103", None).await;
        (queue, renewer, ErrorTracker::new(), message)
    }

    #[tokio::test]
    async fn test_success_deletes() {
        let (queue, renewer, errors, message) = setup().await;

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &processed()).await;

        assert_eq!(resolution, Resolution::Completed);
        assert_eq!(queue.deleted(), vec!["rh-m-1"]);
        assert!(queue.released().is_empty());
        assert_eq!(renewer.active_count(), 0);
    }

    #[tokio::test]
    async fn test_permanent_failure_deletes() {
        let (queue, renewer, errors, message) = setup().await;
        let outcome = failed(WorkerError::config_error("bad"));

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &outcome).await;

        assert_eq!(
            resolution,
            Resolution::Discarded {
                severity: ErrorSeverity::Permanent
            }
        );
        assert_eq!(queue.deleted(), vec!["rh-m-1"]);
        assert_eq!(renewer.active_count(), 0);
    }

    #[tokio::test]
    async fn test_system_fatal_failure_deletes() {
        let (queue, renewer, errors, message) = setup().await;
        let outcome = failed(WorkerError::resource_exhausted("oom"));

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &outcome).await;

        assert_eq!(resolution.severity(), Some(ErrorSeverity::SystemFatal));
        assert_eq!(queue.deleted(), vec!["rh-m-1"]);
    }

    #[tokio::test]
    async fn test_temporary_failure_releases() {
        let (queue, renewer, errors, message) = setup().await;
        let outcome = failed(WorkerError::AnalysisTimeout(Duration::from_secs(5)));

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &outcome).await;

        assert_eq!(resolution, Resolution::Released);
        assert!(queue.deleted().is_empty());
        assert_eq!(queue.released(), vec!["rh-m-1"]);
        assert_eq!(renewer.active_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_delete_releases_and_unregisters() {
        let (queue, renewer, errors, message) = setup().await;
        queue.fail_delete(true);

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &processed()).await;

        assert_eq!(resolution, Resolution::Unresolved { severity: None });
        assert_eq!(queue.released(), vec!["rh-m-1"]);
        assert_eq!(renewer.active_count(), 0);
        assert_eq!(
            errors.detailed_stats().by_operation.get(RESOLVE_MESSAGE),
            Some(&1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_is_not_undone_by_inflight_extension() {
        let (queue, renewer, errors, message) = setup().await;
        queue.delay_visibility(Duration::from_secs(2), Duration::from_secs(1));
        tokio::time::advance(Duration::from_secs(240)).await;

        let sweeper = renewer.clone();
        let sweep = tokio::spawn(async move { sweeper.sweep().await });
        tokio::task::yield_now().await;

        let outcome = failed(WorkerError::AnalysisTimeout(Duration::from_secs(5)));
        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &outcome).await;
        sweep.await.unwrap();

        assert_eq!(resolution, Resolution::Released);
        let windows: Vec<u64> = queue
            .visibility_calls()
            .iter()
            .map(|(_, timeout)| timeout.as_secs())
            .collect();
        // Register, the in-flight extension, then the release last.
        assert_eq!(windows, vec![300, 300, 0]);
        assert_eq!(renewer.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_after_resolution_does_not_extend() {
        let (queue, renewer, errors, message) = setup().await;
        let outcome = failed(WorkerError::AnalysisTimeout(Duration::from_secs(5)));
        resolve(queue.as_ref(), &renewer, &errors, &message, &outcome).await;

        tokio::time::advance(Duration::from_secs(240)).await;
        assert_eq!(renewer.sweep().await.extended, 0);
        assert_eq!(queue.visibility_calls().last().unwrap().1, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_resolution_after_eviction_is_harmless() {
        let (queue, renewer, errors, message) = setup().await;
        renewer.unregister(&message.receipt_handle, LeaseStatus::TimedOut);

        let resolution = resolve(queue.as_ref(), &renewer, &errors, &message, &processed()).await;

        assert_eq!(resolution, Resolution::Completed);
        assert_eq!(renewer.active_count(), 0);
    }
}
