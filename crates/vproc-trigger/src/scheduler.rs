//! Compute scheduler seam and its AWS Batch implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_batch::types::{ContainerOverrides, JobStatus, KeyValuePair};
use aws_sdk_batch::Client;
use tracing::{debug, info};
use vproc_models::ComputeJobStatus;

use crate::error::{TriggerError, TriggerResult};

/// A job occupying a concurrency slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveJob {
    pub job_id: String,
    pub job_name: String,
    pub status: ComputeJobStatus,
}

/// Parameters of a job submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    /// Container environment overrides, in order
    pub environment: Vec<(String, String)>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    pub job_id: String,
    pub job_name: String,
}

#[async_trait]
pub trait ComputeScheduler: Send + Sync {
    /// All jobs in an active state on the given queue. Never cached.
    async fn list_active_jobs(&self, job_queue: &str) -> TriggerResult<Vec<ActiveJob>>;

    async fn submit_job(&self, request: &SubmitRequest) -> TriggerResult<SubmittedJob>;

    /// Look up an active job by name.
    async fn find_active_job(
        &self,
        job_queue: &str,
        job_name: &str,
    ) -> TriggerResult<Option<ActiveJob>> {
        Ok(self
            .list_active_jobs(job_queue)
            .await?
            .into_iter()
            .find(|job| job.job_name == job_name))
    }
}

/// AWS Batch scheduler.
#[derive(Clone)]
pub struct BatchScheduler {
    client: Client,
}

impl BatchScheduler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create from the default AWS environment.
    pub async fn from_env() -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self::new(Client::new(&sdk_config))
    }

    async fn list_jobs_in_status(
        &self,
        job_queue: &str,
        status: ComputeJobStatus,
    ) -> TriggerResult<Vec<ActiveJob>> {
        let mut jobs = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_jobs()
                .job_queue(job_queue)
                .job_status(JobStatus::from(status.as_str()))
                .set_next_token(next_token.take())
                .send()
                .await
                .map_err(|e| TriggerError::from_sdk("ListJobs", e))?;

            for summary in output.job_summary_list() {
                jobs.push(ActiveJob {
                    job_id: summary.job_id().unwrap_or_default().to_string(),
                    job_name: summary.job_name().unwrap_or_default().to_string(),
                    status,
                });
            }

            match output.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        Ok(jobs)
    }
}

#[async_trait]
impl ComputeScheduler for BatchScheduler {
    async fn list_active_jobs(&self, job_queue: &str) -> TriggerResult<Vec<ActiveJob>> {
        let mut active = Vec::new();
        for status in ComputeJobStatus::ACTIVE {
            active.extend(self.list_jobs_in_status(job_queue, status).await?);
        }
        debug!(job_queue, count = active.len(), "Listed active jobs");
        Ok(active)
    }

    async fn submit_job(&self, request: &SubmitRequest) -> TriggerResult<SubmittedJob> {
        let environment = request
            .environment
            .iter()
            .map(|(name, value)| KeyValuePair::builder().name(name).value(value).build())
            .collect::<Vec<_>>();

        let overrides = ContainerOverrides::builder()
            .set_environment(Some(environment))
            .build();

        let output = self
            .client
            .submit_job()
            .job_name(&request.job_name)
            .job_queue(&request.job_queue)
            .job_definition(&request.job_definition)
            .container_overrides(overrides)
            .set_tags(Some(request.tags.clone()))
            .send()
            .await
            .map_err(|e| TriggerError::from_sdk("SubmitJob", e))?;

        let job_id = output
            .job_id()
            .map(str::to_string)
            .ok_or_else(|| TriggerError::scheduler("SubmitJob", "response without job id"))?;

        info!(job_id = %job_id, job_name = %request.job_name, "Submitted compute job");

        Ok(SubmittedJob {
            job_id,
            job_name: request.job_name.clone(),
        })
    }
}
