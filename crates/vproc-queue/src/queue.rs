//! Work queue backed by SQS.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_sqs::types::{Message, QueueAttributeName};
use aws_sdk_sqs::Client;
use tracing::{debug, info};

use crate::error::{QueueError, QueueResult};

/// SQS caps long polling at 20 seconds.
pub const MAX_WAIT_TIME: Duration = Duration::from_secs(20);

/// SQS caps a visibility window at 12 hours.
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Queue URL
    pub queue_url: String,
    /// AWS region
    pub region: String,
    /// Custom endpoint (LocalStack)
    pub endpoint_url: Option<String>,
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> QueueResult<Self> {
        let queue_url = std::env::var("SQS_QUEUE_URL")
            .or_else(|_| std::env::var("AWS_SQS_QUEUE_URL"))
            .map_err(|_| QueueError::config_error("SQS_QUEUE_URL not set"))?;

        let region = std::env::var("AWS_SQS_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .unwrap_or_else(|_| "ap-northeast-2".to_string());

        let use_localstack = std::env::var("USE_LOCALSTACK")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let endpoint_url = if use_localstack {
            Some(
                std::env::var("AWS_ENDPOINT_URL")
                    .unwrap_or_else(|_| "http://localhost:4566".to_string()),
            )
        } else {
            None
        };

        Ok(Self {
            queue_url,
            region,
            endpoint_url,
        })
    }
}

/// Parameters of a receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Maximum messages to return (1-10)
    pub max_messages: u32,
    /// Long-poll wait
    pub wait_time: Duration,
    /// Visibility window granted to the returned messages
    pub visibility_timeout: Duration,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: 1,
            wait_time: MAX_WAIT_TIME,
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// A message claimed from the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub message_id: String,
    /// Delivery handle, unique per claim
    pub receipt_handle: String,
    pub body: String,
    /// String message attributes
    pub attributes: HashMap<String, String>,
}

impl QueueMessage {
    fn from_sqs(message: &Message) -> QueueResult<Self> {
        let receipt_handle = message
            .receipt_handle()
            .ok_or_else(|| QueueError::invalid_message("message without receipt handle"))?
            .to_string();

        let attributes = message
            .message_attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .filter_map(|(name, value)| {
                        value
                            .string_value()
                            .map(|v| (name.clone(), v.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            message_id: message.message_id().unwrap_or_default().to_string(),
            receipt_handle,
            body: message.body().unwrap_or_default().to_string(),
            attributes,
        })
    }
}

/// Queue operations the dispatch pipeline depends on.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Long-poll for messages.
    async fn receive(&self, request: ReceiveRequest) -> QueueResult<Vec<QueueMessage>>;

    /// Set a new visibility window for a claimed message, counted from now.
    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> QueueResult<()>;

    /// Remove a message permanently.
    async fn delete(&self, receipt_handle: &str) -> QueueResult<()>;

    /// Make a claimed message visible to other consumers immediately.
    async fn release(&self, receipt_handle: &str) -> QueueResult<()> {
        self.change_visibility(receipt_handle, Duration::ZERO).await
    }
}

/// SQS queue client.
#[derive(Clone)]
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    /// Create a new queue client.
    pub async fn new(config: QueueConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint_url {
            let credentials = Credentials::new(
                std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_else(|_| "test".to_string()),
                std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_else(|_| "test".to_string()),
                None,
                None,
                "localstack",
            );
            loader = loader.endpoint_url(endpoint).credentials_provider(credentials);
            info!("Using LocalStack SQS endpoint: {}", endpoint);
        }

        let sdk_config = loader.load().await;

        Self {
            client: Client::new(&sdk_config),
            queue_url: config.queue_url,
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Ok(Self::new(QueueConfig::from_env()?).await)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    pub(crate) fn client(&self) -> &Client {
        &self.client
    }

    /// Fetch all queue attributes (depth, in-flight count, ...).
    pub async fn queue_attributes(&self) -> QueueResult<HashMap<String, String>> {
        let output = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("GetQueueAttributes", e))?;

        Ok(output
            .attributes()
            .map(|attrs| {
                attrs
                    .iter()
                    .map(|(name, value)| (name.as_str().to_string(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl WorkQueue for SqsQueue {
    async fn receive(&self, request: ReceiveRequest) -> QueueResult<Vec<QueueMessage>> {
        let wait = request.wait_time.min(MAX_WAIT_TIME);
        let visibility = request.visibility_timeout.min(MAX_VISIBILITY_TIMEOUT);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(request.max_messages.clamp(1, 10) as i32)
            .wait_time_seconds(wait.as_secs() as i32)
            .visibility_timeout(visibility.as_secs() as i32)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("ReceiveMessage", e))?;

        let messages = output
            .messages()
            .iter()
            .map(QueueMessage::from_sqs)
            .collect::<QueueResult<Vec<_>>>()?;

        debug!("Received {} messages", messages.len());
        Ok(messages)
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> QueueResult<()> {
        let timeout = timeout.min(MAX_VISIBILITY_TIMEOUT);

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(timeout.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("ChangeMessageVisibility", e))?;

        debug!("Changed message visibility to {}s", timeout.as_secs());
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> QueueResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| QueueError::from_sdk("DeleteMessage", e))?;

        debug!("Deleted message");
        Ok(())
    }
}
