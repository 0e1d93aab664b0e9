//! Publishing `video-uploaded` messages.

use aws_sdk_sqs::types::MessageAttributeValue;
use serde_json::{Map, Value};
use tracing::info;
use vproc_models::{VideoId, VideoUploadedMessage};

use crate::error::{QueueError, QueueResult};
use crate::queue::SqsQueue;

/// Identifiers returned by a successful send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub md5_of_body: Option<String>,
}

impl SqsQueue {
    /// Publish a `video-uploaded` message for an object that was just stored.
    pub async fn publish_upload(
        &self,
        bucket: &str,
        key: &str,
        video_id: VideoId,
        additional_data: Option<Map<String, Value>>,
    ) -> QueueResult<PublishReceipt> {
        let mut message = VideoUploadedMessage::new(bucket, key, video_id);
        if let Some(data) = additional_data {
            message = message.with_additional_data(data);
        }
        self.publish_video_uploaded(&message).await
    }

    /// Send a prepared message with its routing attributes.
    pub async fn publish_video_uploaded(
        &self,
        message: &VideoUploadedMessage,
    ) -> QueueResult<PublishReceipt> {
        message
            .s3
            .validate()
            .map_err(|e| QueueError::invalid_message(e.to_string()))?;

        let body = serde_json::to_string(message)?;

        let mut request = self
            .client()
            .send_message()
            .queue_url(self.queue_url())
            .message_body(body);

        for (name, value) in message.attributes() {
            let attribute = MessageAttributeValue::builder()
                .data_type("String")
                .string_value(value)
                .build()
                .map_err(|e| QueueError::invalid_message(e.to_string()))?;
            request = request.message_attributes(name, attribute);
        }

        let output = request
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("SendMessage", e))?;

        let receipt = PublishReceipt {
            message_id: output.message_id().unwrap_or_default().to_string(),
            md5_of_body: output.md5_of_message_body().map(str::to_string),
        };

        info!(
            message_id = %receipt.message_id,
            video_id = ?message.video.id,
            key = %message.s3.key,
            "Published video-uploaded message"
        );

        Ok(receipt)
    }
}
