//! Queue message payloads.
//!
//! Two body formats reach the pipeline:
//! - [`VideoUploadedMessage`], published by the upload API after an object is stored
//! - [`S3EventNotification`], sent by the bucket itself when notifications are wired
//!   straight to the queue
//!
//! Both are normalized into a [`JobPayload`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::{PayloadError, PayloadResult};
use crate::utils::extract_video_id_from_key;
use crate::video::{VideoId, VideoStatus};

/// Event type of messages published after an upload completes.
pub const EVENT_TYPE_VIDEO_UPLOADED: &str = "video-uploaded";

/// Message attribute names, readable without deserializing the body.
pub mod attributes {
    pub const VIDEO_ID: &str = "video_id";
    pub const EVENT_TYPE: &str = "event_type";
    pub const S3_BUCKET: &str = "s3_bucket";
}

/// Location of an object in storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// `s3://bucket/key` form, for logs.
    pub fn uri(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Reject empty bucket or key.
    pub fn validate(&self) -> PayloadResult<()> {
        if self.bucket.trim().is_empty() {
            return Err(PayloadError::MissingField("s3.bucket"));
        }
        if self.key.trim().is_empty() {
            return Err(PayloadError::MissingField("s3.key"));
        }
        Ok(())
    }
}

/// Video reference carried by a `video-uploaded` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRef {
    #[serde(default, deserialize_with = "optional_string_or_number")]
    pub id: Option<VideoId>,
    #[serde(default)]
    pub status: VideoStatus,
}

/// Processing hints carried by a `video-uploaded` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingInfo {
    pub request_time: DateTime<Utc>,
    #[serde(default = "default_priority")]
    pub priority: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

/// Body of a `video-uploaded` queue message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoUploadedMessage {
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub s3: S3Location,
    pub video: VideoRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingInfo>,
    /// Free-form keys merged into the body by the publisher.
    #[serde(flatten)]
    pub additional_data: Map<String, Value>,
}

impl VideoUploadedMessage {
    /// Build a message for a freshly stored object.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, video_id: VideoId) -> Self {
        let now = Utc::now();
        Self {
            event_type: EVENT_TYPE_VIDEO_UPLOADED.to_string(),
            timestamp: now,
            s3: S3Location::new(bucket, key),
            video: VideoRef {
                id: Some(video_id),
                status: VideoStatus::Pending,
            },
            processing: Some(ProcessingInfo {
                request_time: now,
                priority: default_priority(),
            }),
            additional_data: Map::new(),
        }
    }

    /// Merge extra keys into the body.
    pub fn with_additional_data(mut self, data: Map<String, Value>) -> Self {
        self.additional_data.extend(data);
        self
    }

    /// Message attributes mirroring the body's routing fields.
    pub fn attributes(&self) -> HashMap<String, String> {
        let mut attrs = HashMap::new();
        if let Some(id) = &self.video.id {
            attrs.insert(attributes::VIDEO_ID.to_string(), id.to_string());
        }
        attrs.insert(attributes::EVENT_TYPE.to_string(), self.event_type.clone());
        attrs.insert(attributes::S3_BUCKET.to_string(), self.s3.bucket.clone());
        attrs
    }
}

/// Raw S3 bucket notification.
#[derive(Debug, Clone, Deserialize)]
pub struct S3EventNotification {
    #[serde(rename = "Records", default)]
    pub records: Vec<S3EventRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3EventRecord {
    #[serde(default)]
    pub event_time: Option<DateTime<Utc>>,
    pub s3: S3EventEntity,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3EventEntity {
    pub bucket: S3EventBucket,
    pub object: S3EventObject,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3EventBucket {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct S3EventObject {
    pub key: String,
    #[serde(default)]
    pub size: u64,
}

/// Normalized unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub video_id: Option<VideoId>,
    pub location: S3Location,
    pub event_time: Option<DateTime<Utc>>,
    /// Originating queue message, for traceability.
    pub message_id: Option<String>,
}

impl JobPayload {
    /// Parse a queue message body in either supported format.
    ///
    /// The video id is resolved from the body, then the `video_id` message
    /// attribute, then the `videos/{id}/...` key convention.
    pub fn from_message(
        body: &str,
        attributes: &HashMap<String, String>,
        message_id: Option<&str>,
    ) -> PayloadResult<Self> {
        let value: Value = serde_json::from_str(body)?;

        let mut payload = if value.get("Records").is_some() {
            Self::from_s3_event(serde_json::from_value(value)?)?
        } else {
            Self::from_uploaded(serde_json::from_value(value)?)?
        };

        if payload.video_id.is_none() {
            payload.video_id = attributes
                .get(attributes::VIDEO_ID)
                .filter(|id| !id.trim().is_empty())
                .map(|id| VideoId::from(id.as_str()));
        }
        if payload.video_id.is_none() {
            payload.video_id = extract_video_id_from_key(&payload.location.key).map(VideoId::from);
        }

        payload.message_id = message_id.map(str::to_string);
        Ok(payload)
    }

    /// Build a payload from an object locator handed over directly.
    pub fn direct(
        bucket: impl Into<String>,
        key: impl Into<String>,
        video_id: Option<VideoId>,
        message_id: Option<String>,
    ) -> PayloadResult<Self> {
        let location = S3Location::new(bucket, key);
        location.validate()?;

        let video_id = video_id
            .filter(|id| !id.is_empty())
            .or_else(|| extract_video_id_from_key(&location.key).map(VideoId::from));

        Ok(Self {
            video_id,
            location,
            event_time: Some(Utc::now()),
            message_id,
        })
    }

    fn from_uploaded(message: VideoUploadedMessage) -> PayloadResult<Self> {
        if message.event_type != EVENT_TYPE_VIDEO_UPLOADED {
            return Err(PayloadError::UnsupportedEvent(message.event_type));
        }
        message.s3.validate()?;

        Ok(Self {
            video_id: message.video.id.filter(|id| !id.is_empty()),
            location: message.s3,
            event_time: Some(message.timestamp),
            message_id: None,
        })
    }

    fn from_s3_event(event: S3EventNotification) -> PayloadResult<Self> {
        let record = event
            .records
            .into_iter()
            .next()
            .ok_or(PayloadError::MissingField("Records"))?;

        // Notification keys are form-encoded.
        let raw_key = record.s3.object.key.replace('+', " ");
        let key = urlencoding::decode(&raw_key)
            .map_err(|e| PayloadError::invalid_field("s3.object.key", e.to_string()))?
            .into_owned();

        let location = S3Location::new(record.s3.bucket.name, key);
        location.validate()?;

        Ok(Self {
            video_id: None,
            location,
            event_time: record.event_time,
            message_id: None,
        })
    }

    /// The video id, or a validation error when none could be resolved.
    pub fn require_video_id(&self) -> PayloadResult<&VideoId> {
        self.video_id
            .as_ref()
            .ok_or(PayloadError::MissingField("video.id"))
    }
}

fn optional_string_or_number<'de, D>(deserializer: D) -> Result<Option<VideoId>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(VideoId::from(s)),
        Some(Value::Number(n)) => Some(VideoId::from(n.to_string())),
        _ => None,
    })
}
