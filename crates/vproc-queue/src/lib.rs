//! SQS work queue for video analysis messages.
//!
//! This crate provides:
//! - The [`WorkQueue`] seam used by workers (receive, extend, release, delete)
//! - An SQS-backed implementation with LocalStack support
//! - Publishing of `video-uploaded` messages

pub mod error;
pub mod publisher;
pub mod queue;

pub use error::{QueueError, QueueResult};
pub use publisher::PublishReceipt;
pub use queue::{QueueConfig, QueueMessage, ReceiveRequest, SqsQueue, WorkQueue};
