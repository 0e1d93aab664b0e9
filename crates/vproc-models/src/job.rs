//! Compute job identity and scheduler job states.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::JobPayload;
use crate::utils::{file_stem, normalize_job_name};

/// Prefix shared by all analysis job names.
const IDENTITY_PREFIX: &str = "video";

/// Deterministic identity of an analysis job.
///
/// Used both as the compute job name and as the de-duplication key: two
/// messages describing the same video always produce the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(String);

impl JobIdentity {
    /// Derive the identity for a payload.
    ///
    /// `video-{id}` when the payload carries a video id, otherwise
    /// `video-{file stem}` from the object key.
    pub fn for_payload(payload: &JobPayload) -> Self {
        match payload.video_id.as_ref() {
            Some(id) if !id.is_empty() => Self::from_parts(id.as_str()),
            _ => Self::from_parts(file_stem(&payload.location.key)),
        }
    }

    /// Derive an identity from an object key alone.
    pub fn for_key(key: &str) -> Self {
        match crate::utils::extract_video_id_from_key(key) {
            Some(id) => Self::from_parts(&id),
            None => Self::from_parts(file_stem(key)),
        }
    }

    fn from_parts(suffix: &str) -> Self {
        Self(normalize_job_name(&format!("{}-{}", IDENTITY_PREFIX, suffix)))
    }

    /// Wrap an existing job name (e.g. one listed by the scheduler).
    pub fn from_name(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job in the compute scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComputeJobStatus {
    Submitted,
    Pending,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
}

impl ComputeJobStatus {
    /// States that occupy a concurrency slot.
    pub const ACTIVE: [ComputeJobStatus; 5] = [
        ComputeJobStatus::Submitted,
        ComputeJobStatus::Pending,
        ComputeJobStatus::Runnable,
        ComputeJobStatus::Starting,
        ComputeJobStatus::Running,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComputeJobStatus::Submitted => "SUBMITTED",
            ComputeJobStatus::Pending => "PENDING",
            ComputeJobStatus::Runnable => "RUNNABLE",
            ComputeJobStatus::Starting => "STARTING",
            ComputeJobStatus::Running => "RUNNING",
            ComputeJobStatus::Succeeded => "SUCCEEDED",
            ComputeJobStatus::Failed => "FAILED",
        }
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }
}

impl fmt::Display for ComputeJobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
