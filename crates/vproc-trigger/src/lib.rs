//! Admission trigger for video analysis jobs.
//!
//! Invoked once per batch of queue messages. For each message it derives a
//! deterministic job identity and submits a compute job unless one with that
//! identity is already active or the concurrency ceiling is reached.
//!
//! This crate provides:
//! - The [`ComputeScheduler`] seam and an AWS Batch implementation
//! - The queue batch event and partial-failure response types
//! - The [`AdmissionTrigger`] handler

pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod scheduler;

pub use config::TriggerConfig;
pub use error::{TriggerError, TriggerResult};
pub use event::{BatchItemFailure, BatchResponse, SqsEvent, SqsRecord};
pub use handler::{AdmissionTrigger, FailedRecord, TriggerOutcome, TriggerReport};
pub use scheduler::{ActiveJob, BatchScheduler, ComputeScheduler, SubmitRequest, SubmittedJob};
