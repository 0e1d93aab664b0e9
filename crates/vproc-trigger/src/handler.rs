//! Admission control for compute job submission.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::{error, info, warn};
use vproc_models::{JobIdentity, JobPayload};

use crate::config::TriggerConfig;
use crate::event::{BatchResponse, SqsEvent, SqsRecord};
use crate::scheduler::{ComputeScheduler, SubmitRequest, SubmittedJob};

/// Tag value identifying jobs submitted by this trigger.
pub const SOURCE_TAG: &str = "vproc-trigger";

/// A record that was not handled and will be redelivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedRecord {
    pub message_id: String,
    pub reason: String,
}

/// What happened to each record of a batch.
#[derive(Debug, Clone, Default)]
pub struct TriggerReport {
    /// Active jobs seen before the batch was processed
    pub active_jobs: usize,
    /// Whole batch rejected because the ceiling was already reached
    pub throttled: bool,
    pub submitted: Vec<SubmittedJob>,
    /// Message ids skipped because their job is already active
    pub duplicates: Vec<String>,
    pub failed: Vec<FailedRecord>,
}

#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    pub response: BatchResponse,
    pub report: TriggerReport,
}

enum RecordResult {
    Submitted(SubmittedJob),
    Duplicate,
}

/// Submits at most one active compute job per job identity.
pub struct AdmissionTrigger {
    config: TriggerConfig,
    scheduler: Arc<dyn ComputeScheduler>,
}

impl AdmissionTrigger {
    pub fn new(config: TriggerConfig, scheduler: Arc<dyn ComputeScheduler>) -> Self {
        Self { config, scheduler }
    }

    /// Process one batch of queue messages.
    ///
    /// Records listed in the response's failures are redelivered by the queue;
    /// every other record counts as handled.
    pub async fn handle(&self, event: &SqsEvent) -> TriggerOutcome {
        let mut response = BatchResponse::default();
        let mut report = TriggerReport::default();

        info!(records = event.records.len(), "Received trigger batch");

        let active = match self.scheduler.list_active_jobs(&self.config.job_queue).await {
            Ok(active) => active,
            Err(e) => {
                error!("Failed to list active jobs: {}", e);
                for record in &event.records {
                    fail(&mut response, &mut report, record, e.to_string());
                }
                return TriggerOutcome { response, report };
            }
        };

        report.active_jobs = active.len();
        if active.len() >= self.config.max_concurrent_jobs {
            warn!(
                active = active.len(),
                max = self.config.max_concurrent_jobs,
                "Concurrency ceiling reached, deferring whole batch"
            );
            report.throttled = true;
            for record in &event.records {
                fail(&mut response, &mut report, record, "concurrency ceiling reached".to_string());
            }
            return TriggerOutcome { response, report };
        }

        let active_names: HashSet<String> = active.into_iter().map(|job| job.job_name).collect();
        let mut submitted_names: HashSet<JobIdentity> = HashSet::new();
        let mut in_flight = report.active_jobs;

        for record in &event.records {
            if in_flight >= self.config.max_concurrent_jobs {
                fail(&mut response, &mut report, record, "concurrency ceiling reached".to_string());
                continue;
            }

            match self
                .handle_record(record, &active_names, &mut submitted_names)
                .await
            {
                Ok(RecordResult::Submitted(job)) => {
                    in_flight += 1;
                    report.submitted.push(job);
                }
                Ok(RecordResult::Duplicate) => {
                    report.duplicates.push(record.message_id.clone());
                }
                Err(reason) => fail(&mut response, &mut report, record, reason),
            }
        }

        info!(
            submitted = report.submitted.len(),
            duplicates = report.duplicates.len(),
            failed = report.failed.len(),
            "Trigger batch complete"
        );

        TriggerOutcome { response, report }
    }

    async fn handle_record(
        &self,
        record: &SqsRecord,
        active_names: &HashSet<String>,
        submitted_names: &mut HashSet<JobIdentity>,
    ) -> Result<RecordResult, String> {
        let payload = JobPayload::from_message(
            &record.body,
            &record.string_attributes(),
            Some(record.message_id.as_str()),
        )
        .map_err(|e| format!("invalid payload: {}", e))?;

        let identity = JobIdentity::for_payload(&payload);

        if submitted_names.contains(&identity) || active_names.contains(identity.as_str()) {
            info!(message_id = %record.message_id, job_name = %identity, "Job already active, skipping");
            return Ok(RecordResult::Duplicate);
        }

        // Second read, right before submitting.
        match self
            .scheduler
            .find_active_job(&self.config.job_queue, identity.as_str())
            .await
        {
            Ok(Some(job)) => {
                info!(
                    message_id = %record.message_id,
                    job_name = %identity,
                    job_id = %job.job_id,
                    "Job became active before submission, skipping"
                );
                submitted_names.insert(identity);
                return Ok(RecordResult::Duplicate);
            }
            Ok(None) => {}
            Err(e) => return Err(format!("active job re-check failed: {}", e)),
        }

        let request = self.submit_request(record, &payload, &identity);
        info!(
            message_id = %record.message_id,
            job_name = %identity,
            source = %payload.location.uri(),
            "Submitting compute job"
        );

        let job = self
            .scheduler
            .submit_job(&request)
            .await
            .map_err(|e| format!("submission failed: {}", e))?;

        submitted_names.insert(identity);
        Ok(RecordResult::Submitted(job))
    }

    fn submit_request(
        &self,
        record: &SqsRecord,
        payload: &JobPayload,
        identity: &JobIdentity,
    ) -> SubmitRequest {
        let mut environment = vec![
            ("S3_BUCKET".to_string(), payload.location.bucket.clone()),
            ("S3_KEY".to_string(), payload.location.key.clone()),
            ("MESSAGE_ID".to_string(), record.message_id.clone()),
        ];
        if let Some(video_id) = &payload.video_id {
            environment.push(("VIDEO_ID".to_string(), video_id.to_string()));
        }

        let tags = HashMap::from([
            ("Source".to_string(), SOURCE_TAG.to_string()),
            ("MessageId".to_string(), record.message_id.clone()),
            ("S3Bucket".to_string(), payload.location.bucket.clone()),
        ]);

        SubmitRequest {
            job_name: identity.as_str().to_string(),
            job_queue: self.config.job_queue.clone(),
            job_definition: self.config.job_definition.clone(),
            environment,
            tags,
        }
    }
}

fn fail(response: &mut BatchResponse, report: &mut TriggerReport, record: &SqsRecord, reason: String) {
    warn!(message_id = %record.message_id, "Record not handled: {}", reason);
    response.fail(record.message_id.clone());
    report.failed.push(FailedRecord {
        message_id: record.message_id.clone(),
        reason,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{TriggerError, TriggerResult};
    use crate::scheduler::ActiveJob;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use vproc_models::ComputeJobStatus;

    #[derive(Default)]
    struct FakeScheduler {
        active: Mutex<Vec<ActiveJob>>,
        submissions: Mutex<Vec<SubmitRequest>>,
        list_calls: Mutex<usize>,
        /// Jobs that only show up from the second read on.
        started_late: Vec<ActiveJob>,
        fail_submit: bool,
    }

    impl FakeScheduler {
        fn with_active(names: &[&str]) -> Self {
            let active = names
                .iter()
                .enumerate()
                .map(|(i, name)| ActiveJob {
                    job_id: format!("job-{}", i),
                    job_name: name.to_string(),
                    status: ComputeJobStatus::Running,
                })
                .collect();
            Self {
                active: Mutex::new(active),
                ..Default::default()
            }
        }

        fn submissions(&self) -> Vec<SubmitRequest> {
            self.submissions.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ComputeScheduler for FakeScheduler {
        async fn list_active_jobs(&self, _job_queue: &str) -> TriggerResult<Vec<ActiveJob>> {
            let mut calls = self.list_calls.lock().unwrap();
            *calls += 1;
            let mut jobs = self.active.lock().unwrap().clone();
            if *calls > 1 {
                jobs.extend(self.started_late.iter().cloned());
            }
            Ok(jobs)
        }

        async fn submit_job(&self, request: &SubmitRequest) -> TriggerResult<SubmittedJob> {
            if self.fail_submit {
                return Err(TriggerError::scheduler("SubmitJob", "boom"));
            }
            let mut submissions = self.submissions.lock().unwrap();
            submissions.push(request.clone());
            // Submitted jobs become visible to later reads.
            self.active.lock().unwrap().push(ActiveJob {
                job_id: format!("submitted-{}", submissions.len()),
                job_name: request.job_name.clone(),
                status: ComputeJobStatus::Submitted,
            });
            Ok(SubmittedJob {
                job_id: format!("submitted-{}", submissions.len()),
                job_name: request.job_name.clone(),
            })
        }
    }

    fn record(message_id: &str, video_id: u64) -> serde_json::Value {
        json!({
            "messageId": message_id,
            "receiptHandle": format!("rh-{}", message_id),
            "body": json!({
                "eventType": "video-uploaded",
                "timestamp": "2024-05-01T10:00:00Z",
                "s3": {"bucket": "raw-videos", "key": format!("videos/{}/raw.mp4", video_id)},
                "video": {"id": video_id, "status": "pending"}
            }).to_string(),
            "messageAttributes": {}
        })
    }

    fn event(records: Vec<serde_json::Value>) -> SqsEvent {
        serde_json::from_value(json!({ "Records": records })).unwrap()
    }

    fn trigger(scheduler: Arc<FakeScheduler>, max: usize) -> AdmissionTrigger {
        AdmissionTrigger::new(
            TriggerConfig::new("analysis-queue", "analysis-job:3").with_max_concurrent_jobs(max),
            scheduler,
        )
    }

    #[tokio::test]
    async fn test_same_identity_submits_once() {
        let scheduler = Arc::new(FakeScheduler::default());
        let trigger = trigger(scheduler.clone(), 5);

        let outcome = trigger
            .handle(&event(vec![record("m-1", 7), record("m-2", 7), record("m-3", 7)]))
            .await;

        assert_eq!(scheduler.submissions().len(), 1);
        assert_eq!(outcome.report.submitted.len(), 1);
        assert_eq!(outcome.report.duplicates, vec!["m-2", "m-3"]);
        assert!(outcome.response.is_empty());
    }

    #[tokio::test]
    async fn test_ceiling_rejects_whole_batch() {
        let scheduler = Arc::new(FakeScheduler::with_active(&["video-1"]));
        let trigger = trigger(scheduler.clone(), 1);

        let outcome = trigger
            .handle(&event(vec![record("m-1", 2), record("m-2", 3)]))
            .await;

        assert!(scheduler.submissions().is_empty());
        assert!(outcome.report.throttled);
        let failed: Vec<_> = outcome
            .response
            .batch_item_failures
            .iter()
            .map(|f| f.item_identifier.as_str())
            .collect();
        assert_eq!(failed, vec!["m-1", "m-2"]);
    }

    #[tokio::test]
    async fn test_submission_carries_payload_fields() {
        let scheduler = Arc::new(FakeScheduler::default());
        let trigger = trigger(scheduler.clone(), 1);

        let outcome = trigger.handle(&event(vec![record("m-103", 103)])).await;
        assert!(outcome.response.is_empty());

        let submissions = scheduler.submissions();
        assert_eq!(submissions.len(), 1);
        let request = &submissions[0];
        assert_eq!(request.job_name, "video-103");
        assert_eq!(request.job_queue, "analysis-queue");
        assert_eq!(request.job_definition, "analysis-job:3");

        let env: HashMap<_, _> = request.environment.iter().cloned().collect();
        assert_eq!(env.get("VIDEO_ID").map(String::as_str), Some("103"));
        assert_eq!(env.get("S3_BUCKET").map(String::as_str), Some("raw-videos"));
        assert_eq!(env.get("S3_KEY").map(String::as_str), Some("videos/103/raw.mp4"));
        assert_eq!(env.get("MESSAGE_ID").map(String::as_str), Some("m-103"));
        assert_eq!(request.tags.get("Source").map(String::as_str), Some(SOURCE_TAG));
    }

    #[tokio::test]
    async fn test_existing_active_job_is_duplicate() {
        let scheduler = Arc::new(FakeScheduler::with_active(&["video-9"]));
        let trigger = trigger(scheduler.clone(), 5);

        let outcome = trigger.handle(&event(vec![record("m-1", 9)])).await;

        assert!(scheduler.submissions().is_empty());
        assert_eq!(outcome.report.duplicates, vec!["m-1"]);
        assert!(outcome.response.is_empty());
    }

    #[tokio::test]
    async fn test_job_started_between_reads_is_duplicate() {
        let scheduler = Arc::new(FakeScheduler {
            started_late: vec![ActiveJob {
                job_id: "job-other".to_string(),
                job_name: "video-5".to_string(),
                status: ComputeJobStatus::Runnable,
            }],
            ..Default::default()
        });
        let trigger = trigger(scheduler.clone(), 5);

        let outcome = trigger.handle(&event(vec![record("m-1", 5)])).await;

        assert!(scheduler.submissions().is_empty());
        assert!(outcome.report.submitted.is_empty());
        assert_eq!(outcome.report.duplicates, vec!["m-1"]);
        assert!(outcome.response.is_empty());
        assert_eq!(*scheduler.list_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_submissions_count_toward_ceiling() {
        let scheduler = Arc::new(FakeScheduler::default());
        let trigger = trigger(scheduler.clone(), 2);

        let outcome = trigger
            .handle(&event(vec![record("m-1", 1), record("m-2", 2), record("m-3", 3)]))
            .await;

        assert_eq!(scheduler.submissions().len(), 2);
        assert_eq!(outcome.response.batch_item_failures.len(), 1);
        assert_eq!(outcome.response.batch_item_failures[0].item_identifier, "m-3");
    }

    #[tokio::test]
    async fn test_unparseable_record_is_reported() {
        let scheduler = Arc::new(FakeScheduler::default());
        let trigger = trigger(scheduler.clone(), 5);

        let bad = json!({"messageId": "m-bad", "receiptHandle": "rh", "body": "not json"});
        let outcome = trigger.handle(&event(vec![bad, record("m-ok", 4)])).await;

        assert_eq!(scheduler.submissions().len(), 1);
        assert_eq!(outcome.report.failed.len(), 1);
        assert_eq!(outcome.report.failed[0].message_id, "m-bad");
        assert_eq!(outcome.response.batch_item_failures[0].item_identifier, "m-bad");
    }

    #[tokio::test]
    async fn test_submit_error_is_reported() {
        let scheduler = Arc::new(FakeScheduler {
            fail_submit: true,
            ..Default::default()
        });
        let trigger = trigger(scheduler.clone(), 5);

        let outcome = trigger.handle(&event(vec![record("m-1", 5)])).await;

        assert_eq!(outcome.response.batch_item_failures.len(), 1);
        assert!(outcome.report.failed[0].reason.contains("submission failed"));
    }

    #[tokio::test]
    async fn test_scheduler_is_read_twice_per_submission() {
        let scheduler = Arc::new(FakeScheduler::default());
        let trigger = trigger(scheduler.clone(), 5);

        trigger.handle(&event(vec![record("m-1", 8)])).await;

        assert_eq!(*scheduler.list_calls.lock().unwrap(), 2);
    }
}
