//! Shared data models for the video dispatch pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - The `video-uploaded` queue message and raw S3 event notifications
//! - The normalized job payload consumed by workers
//! - Job identities used for compute job de-duplication
//! - Compute scheduler job states

pub mod error;
pub mod job;
pub mod message;
pub mod utils;
pub mod video;

// Re-export common types
pub use error::{PayloadError, PayloadResult};
pub use job::{ComputeJobStatus, JobIdentity};
pub use message::{
    attributes, JobPayload, ProcessingInfo, S3EventNotification, S3Location, VideoRef,
    VideoUploadedMessage, EVENT_TYPE_VIDEO_UPLOADED,
};
pub use utils::{extract_video_id_from_key, file_stem, normalize_job_name};
pub use video::{VideoId, VideoStatus};
