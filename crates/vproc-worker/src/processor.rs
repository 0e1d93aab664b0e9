//! Per-message video analysis pipeline.
//!
//! A claimed message runs through fixed stages, each with its own retry
//! budget: parse the payload, fetch the source object, run the analysis,
//! persist the result and report the final status. The pipeline never
//! touches the queue; the caller resolves the message from the outcome.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;
use vproc_models::{normalize_job_name, JobPayload, VideoId, VideoStatus};
use vproc_queue::QueueMessage;
use vproc_storage::ObjectStore;

use crate::analyzer::{AnalysisRequest, VideoAnalyzer};
use crate::config::{StageAttempts, WorkerConfig};
use crate::error::WorkerResult;
use crate::error_tracker::ErrorTracker;
use crate::logging::JobLogger;
use crate::metrics;
use crate::results::ResultStore;
use crate::retry::{retry_with_backoff, RetryPolicy, StageFailure};
use crate::status::StatusReporter;

/// Stage names, used as retry operation labels and metric labels.
pub mod stages {
    pub const PARSE_PAYLOAD: &str = "parse_payload";
    pub const FETCH_SOURCE: &str = "fetch_source";
    pub const ANALYZE: &str = "analyze";
    pub const PERSIST_RESULTS: &str = "persist_results";
    pub const UPDATE_STATUS: &str = "update_status";
}

const OUTPUT_DIR_NAME: &str = "output";
const FALLBACK_SOURCE_NAME: &str = "source.mp4";

/// Outcome of a successfully processed video.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedVideo {
    pub video_id: VideoId,
    pub result_path: PathBuf,
    pub analysis_duration: Duration,
    pub bytes_fetched: u64,
}

/// Runs the analysis stages for one message at a time.
pub struct VideoPipeline {
    work_dir: PathBuf,
    retry: RetryPolicy,
    stages: StageAttempts,
    store: Arc<dyn ObjectStore>,
    analyzer: Arc<dyn VideoAnalyzer>,
    results: Arc<dyn ResultStore>,
    status: Arc<dyn StatusReporter>,
    errors: Arc<ErrorTracker>,
}

impl VideoPipeline {
    pub fn new(
        config: &WorkerConfig,
        store: Arc<dyn ObjectStore>,
        analyzer: Arc<dyn VideoAnalyzer>,
        results: Arc<dyn ResultStore>,
        status: Arc<dyn StatusReporter>,
        errors: Arc<ErrorTracker>,
    ) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            retry: config.retry.clone(),
            stages: config.stages.clone(),
            store,
            analyzer,
            results,
            status,
            errors,
        }
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    /// Parse a queue message and run it through the pipeline.
    pub async fn process_message(
        &self,
        message: &QueueMessage,
    ) -> Result<ProcessedVideo, StageFailure> {
        let payload = self
            .run_stage(
                stages::PARSE_PAYLOAD,
                self.stages.parse,
                &message.message_id,
                || async move {
                    let payload = JobPayload::from_message(
                        &message.body,
                        &message.attributes,
                        Some(&message.message_id),
                    )?;
                    payload.require_video_id()?;
                    Ok(payload)
                },
            )
            .await?;

        self.process_payload(&payload).await
    }

    /// Run an already parsed payload through the pipeline.
    ///
    /// The per-job work directory is removed whatever the outcome. On
    /// failure a `failed` status is reported on a best-effort basis.
    pub async fn process_payload(
        &self,
        payload: &JobPayload,
    ) -> Result<ProcessedVideo, StageFailure> {
        let video_id = payload
            .require_video_id()
            .map_err(|e| StageFailure::immediate(stages::PARSE_PAYLOAD, e.into()))?;

        let logger = JobLogger::new(video_id, "video_analysis");
        logger.log_start(&payload.location.uri());

        if let Err(e) = self
            .status
            .report(video_id, VideoStatus::Processing, None)
            .await
        {
            logger.log_warning(&format!("Failed to report processing status: {}", e));
        }

        let job_dir = self.work_dir.join(format!(
            "{}-{}",
            normalize_job_name(video_id.as_str()),
            Uuid::new_v4().simple()
        ));

        let result = self.run(video_id, payload, &job_dir, &logger).await;

        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                logger.log_warning(&format!("Failed to clean work dir: {}", e));
            }
        }

        match &result {
            Ok(processed) => logger.log_completion(&format!(
                "analysis took {:.1}s, result at {}",
                processed.analysis_duration.as_secs_f64(),
                processed.result_path.display()
            )),
            Err(failure) => {
                logger.log_error(&failure.to_string());
                self.report_failure(video_id, failure).await;
            }
        }

        result
    }

    async fn run(
        &self,
        video_id: &VideoId,
        payload: &JobPayload,
        job_dir: &Path,
        logger: &JobLogger,
    ) -> Result<ProcessedVideo, StageFailure> {
        let context = video_id.as_str();

        tokio::fs::create_dir_all(job_dir)
            .await
            .map_err(|e| StageFailure::immediate(stages::FETCH_SOURCE, e.into()))?;

        let input_path = job_dir.join(source_file_name(&payload.location.key));
        let input = &input_path;
        let location = &payload.location;
        let bytes_fetched = self
            .run_stage(stages::FETCH_SOURCE, self.stages.fetch, context, || async move {
                Ok(self.store.download_to(location, input).await?)
            })
            .await?;
        logger.log_progress(&format!("fetched {} bytes", bytes_fetched));

        let request = AnalysisRequest {
            video_id: video_id.clone(),
            input_path: input_path.clone(),
            output_dir: job_dir.join(OUTPUT_DIR_NAME),
        };
        let request = &request;
        let output = self
            .run_stage(stages::ANALYZE, self.stages.analyze, context, || async move {
                self.analyzer.analyze(request).await
            })
            .await?;

        let result = &output.result;
        let result_path = self
            .run_stage(
                stages::PERSIST_RESULTS,
                self.stages.persist,
                context,
                || async move { self.results.save(video_id, result).await },
            )
            .await?;

        self.run_stage(stages::UPDATE_STATUS, self.stages.status, context, || async move {
            self.status
                .report(video_id, VideoStatus::Completed, Some(result))
                .await
        })
        .await?;

        Ok(ProcessedVideo {
            video_id: video_id.clone(),
            result_path,
            analysis_duration: output.duration,
            bytes_fetched,
        })
    }

    async fn run_stage<F, Fut, T>(
        &self,
        stage: &'static str,
        max_attempts: u32,
        context: &str,
        f: F,
    ) -> Result<T, StageFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = WorkerResult<T>>,
    {
        let started = Instant::now();
        let observer = self.errors.observer(context);
        let result = retry_with_backoff(&self.retry, max_attempts, stage, &observer, f).await;

        let elapsed = started.elapsed();
        metrics::record_stage(stage, result.is_ok(), elapsed.as_secs_f64());
        debug!(
            stage,
            context,
            ok = result.is_ok(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Stage finished"
        );
        result
    }

    async fn report_failure(&self, video_id: &VideoId, failure: &StageFailure) {
        // A rejected final status is not retried as another status update.
        if failure.operation == stages::UPDATE_STATUS {
            return;
        }

        let detail = json!({
            "error": failure.error.to_string(),
            "stage": failure.operation,
            "severity": failure.severity,
        });
        if let Err(e) = self
            .status
            .report(video_id, VideoStatus::Failed, Some(&detail))
            .await
        {
            warn!(video_id = %video_id, "Failed to report failed status: {}", e);
        }
    }
}

/// Local file name for a source object, from the last key segment.
fn source_file_name(key: &str) -> String {
    Path::new(key)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_SOURCE_NAME.to_string())
}
