//! S3 object store for video sources.
//!
//! This crate provides:
//! - The [`ObjectStore`] seam used by the worker to fetch source videos
//! - An S3-backed implementation with LocalStack support
//! - Storage errors carrying the remote error code for retry classification

pub mod client;
pub mod error;

pub use client::{ObjectStore, S3Store, StorageConfig};
pub use error::{StorageError, StorageResult};
