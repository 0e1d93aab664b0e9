//! In-memory fakes for the worker's collaborator seams.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;
use vproc_models::{S3Location, VideoId, VideoStatus};
use vproc_queue::{QueueError, QueueMessage, QueueResult, ReceiveRequest, WorkQueue};
use vproc_storage::{ObjectStore, StorageError, StorageResult};

use crate::analyzer::{AnalysisOutput, AnalysisRequest, VideoAnalyzer};
use crate::config::WorkerConfig;
use crate::error::{WorkerError, WorkerResult};
use crate::error_tracker::ErrorTracker;
use crate::processor::VideoPipeline;
use crate::results::ResultStore;
use crate::status::StatusReporter;

pub fn queue_message(message_id: &str, video_id: u64) -> QueueMessage {
    QueueMessage {
        message_id: message_id.to_string(),
        receipt_handle: format!("rh-{}", message_id),
        body: json!({
            "eventType": "video-uploaded",
            "timestamp": "2024-05-01T10:00:00Z",
            "s3": {"bucket": "raw-videos", "key": format!("videos/{}/raw.mp4", video_id)},
            "video": {"id": video_id, "status": "pending"}
        })
        .to_string(),
        attributes: Default::default(),
    }
}

fn service_error(operation: &'static str) -> QueueError {
    QueueError::Service {
        operation,
        code: Some("InternalError".to_string()),
        message: "injected".to_string(),
    }
}

/// Scripted queue. Once the script runs out, receive long-polls and returns nothing.
#[derive(Default)]
pub struct FakeQueue {
    script: Mutex<VecDeque<QueueResult<Vec<QueueMessage>>>>,
    receive_times: Mutex<Vec<Instant>>,
    visibility_calls: Mutex<Vec<(String, Duration)>>,
    deleted: Mutex<Vec<String>>,
    fail_visibility: Mutex<bool>,
    fail_delete: Mutex<bool>,
    /// Latency of (extension, release) visibility calls.
    visibility_delay: Mutex<(Duration, Duration)>,
}

impl FakeQueue {
    pub fn with_messages(messages: Vec<QueueMessage>) -> Self {
        let queue = Self::default();
        queue.push_receive(Ok(messages));
        queue
    }

    pub fn push_receive(&self, result: QueueResult<Vec<QueueMessage>>) {
        self.script.lock().unwrap().push_back(result);
    }

    pub fn fail_visibility(&self, fail: bool) {
        *self.fail_visibility.lock().unwrap() = fail;
    }

    /// Make visibility calls land after a delay; releases use `release`, others `extend`.
    pub fn delay_visibility(&self, extend: Duration, release: Duration) {
        *self.visibility_delay.lock().unwrap() = (extend, release);
    }

    pub fn fail_delete(&self, fail: bool) {
        *self.fail_delete.lock().unwrap() = fail;
    }

    pub fn receive_times(&self) -> Vec<Instant> {
        self.receive_times.lock().unwrap().clone()
    }

    pub fn visibility_calls(&self) -> Vec<(String, Duration)> {
        self.visibility_calls.lock().unwrap().clone()
    }

    pub fn released(&self) -> Vec<String> {
        self.visibility_calls()
            .into_iter()
            .filter(|(_, timeout)| timeout.is_zero())
            .map(|(handle, _)| handle)
            .collect()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkQueue for FakeQueue {
    async fn receive(&self, request: ReceiveRequest) -> QueueResult<Vec<QueueMessage>> {
        self.receive_times.lock().unwrap().push(Instant::now());
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => {
                tokio::time::sleep(request.wait_time).await;
                Ok(Vec::new())
            }
        }
    }

    async fn change_visibility(&self, receipt_handle: &str, timeout: Duration) -> QueueResult<()> {
        let (extend, release) = *self.visibility_delay.lock().unwrap();
        let delay = if timeout.is_zero() { release } else { extend };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_visibility.lock().unwrap() {
            return Err(service_error("ChangeMessageVisibility"));
        }
        self.visibility_calls
            .lock()
            .unwrap()
            .push((receipt_handle.to_string(), timeout));
        Ok(())
    }

    async fn delete(&self, receipt_handle: &str) -> QueueResult<()> {
        if *self.fail_delete.lock().unwrap() {
            return Err(service_error("DeleteMessage"));
        }
        self.deleted.lock().unwrap().push(receipt_handle.to_string());
        Ok(())
    }
}

/// Object store that fails a fixed number of times before succeeding.
pub struct FakeStore {
    failures: AtomicU32,
    error: fn() -> StorageError,
    pub calls: AtomicU32,
}

impl FakeStore {
    pub fn ok() -> Self {
        Self::failing(0, || StorageError::network("GetObject", "unused"))
    }

    pub fn failing(times: u32, error: fn() -> StorageError) -> Self {
        Self {
            failures: AtomicU32::new(times),
            error,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for FakeStore {
    async fn download_to(&self, _location: &S3Location, path: &Path) -> StorageResult<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err((self.error)());
        }
        tokio::fs::write(path, b"video-bytes").await?;
        Ok(11)
    }
}

/// Analyzer returning a fixed result or a fixed error.
pub struct FakeAnalyzer {
    error: Option<fn() -> WorkerError>,
    pub calls: AtomicU32,
}

impl FakeAnalyzer {
    pub fn ok() -> Self {
        Self {
            error: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(error: fn() -> WorkerError) -> Self {
        Self {
            error: Some(error),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl VideoAnalyzer for FakeAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> WorkerResult<AnalysisOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.error {
            return Err(error());
        }
        assert!(request.input_path.exists());
        Ok(AnalysisOutput {
            result: json!({"video_id": request.video_id.as_str(), "persons": 2}),
            duration: Duration::from_secs(1),
        })
    }
}

#[derive(Default)]
pub struct RecordingResults {
    pub saved: Mutex<Vec<(VideoId, Value)>>,
}

#[async_trait]
impl ResultStore for RecordingResults {
    async fn save(&self, video_id: &VideoId, result: &Value) -> WorkerResult<PathBuf> {
        self.saved
            .lock()
            .unwrap()
            .push((video_id.clone(), result.clone()));
        Ok(PathBuf::from(format!("/results/{}.json", video_id)))
    }
}

#[derive(Default)]
pub struct RecordingStatus {
    pub reports: Mutex<Vec<(VideoId, VideoStatus)>>,
}

impl RecordingStatus {
    pub fn statuses(&self) -> Vec<VideoStatus> {
        self.reports.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }
}

#[async_trait]
impl StatusReporter for RecordingStatus {
    async fn report(
        &self,
        video_id: &VideoId,
        status: VideoStatus,
        _result: Option<&Value>,
    ) -> WorkerResult<()> {
        self.reports
            .lock()
            .unwrap()
            .push((video_id.clone(), status));
        Ok(())
    }
}

/// Pipeline wired to fakes, plus handles to inspect them.
pub struct TestPipeline {
    pub pipeline: Arc<VideoPipeline>,
    pub store: Arc<FakeStore>,
    pub analyzer: Arc<FakeAnalyzer>,
    pub results: Arc<RecordingResults>,
    pub status: Arc<RecordingStatus>,
    pub errors: Arc<ErrorTracker>,
}

pub fn test_pipeline(work_dir: &Path, store: FakeStore, analyzer: FakeAnalyzer) -> TestPipeline {
    let config = WorkerConfig {
        work_dir: work_dir.to_path_buf(),
        ..WorkerConfig::default()
    };
    let store = Arc::new(store);
    let analyzer = Arc::new(analyzer);
    let results = Arc::new(RecordingResults::default());
    let status = Arc::new(RecordingStatus::default());
    let errors = Arc::new(ErrorTracker::new());

    let pipeline = Arc::new(VideoPipeline::new(
        &config,
        store.clone(),
        analyzer.clone(),
        results.clone(),
        status.clone(),
        errors.clone(),
    ));

    TestPipeline {
        pipeline,
        store,
        analyzer,
        results,
        status,
        errors,
    }
}
