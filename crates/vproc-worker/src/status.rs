//! Video status reporting.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use vproc_models::{VideoId, VideoStatus};

use crate::error::{WorkerError, WorkerResult};

/// Longest response body quoted in a rejection error.
const MAX_ERROR_BODY: usize = 500;

#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn report(
        &self,
        video_id: &VideoId,
        status: VideoStatus,
        result: Option<&Value>,
    ) -> WorkerResult<()>;
}

/// Reports status to the video API: `PATCH {base_url}/videos/{id}/status`.
#[derive(Debug, Clone)]
pub struct HttpStatusReporter {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpStatusReporter {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> WorkerResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn status_url(&self, video_id: &VideoId) -> String {
        format!("{}/videos/{}/status", self.base_url, video_id)
    }
}

#[async_trait]
impl StatusReporter for HttpStatusReporter {
    async fn report(
        &self,
        video_id: &VideoId,
        status: VideoStatus,
        result: Option<&Value>,
    ) -> WorkerResult<()> {
        let body = json!({
            "status": status,
            "result": result,
        });

        let mut request = self.client.patch(self.status_url(video_id)).json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let code = response.status();
        if !code.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WorkerError::StatusRejected {
                status: code.as_u16(),
                message: text.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        info!(video_id = %video_id, status = status.as_str(), "Video status updated");
        Ok(())
    }
}

/// Writes status changes to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(
        &self,
        video_id: &VideoId,
        status: VideoStatus,
        result: Option<&Value>,
    ) -> WorkerResult<()> {
        info!(
            video_id = %video_id,
            status = status.as_str(),
            has_result = result.is_some(),
            "Video status (no status API configured)"
        );
        Ok(())
    }
}

/// HTTP reporter when `STATUS_API_URL` is set, log reporter otherwise.
pub fn status_reporter_from_env() -> WorkerResult<Arc<dyn StatusReporter>> {
    match std::env::var("STATUS_API_URL") {
        Ok(url) if !url.trim().is_empty() => {
            let timeout = Duration::from_secs(
                std::env::var("STATUS_API_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            );
            let token = std::env::var("STATUS_API_TOKEN").ok();
            Ok(Arc::new(HttpStatusReporter::new(url, token, timeout)?))
        }
        _ => Ok(Arc::new(LogStatusReporter)),
    }
}
