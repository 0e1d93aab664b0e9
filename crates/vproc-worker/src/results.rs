//! Analysis result persistence.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;
use uuid::Uuid;
use vproc_models::{normalize_job_name, VideoId};

use crate::error::WorkerResult;

/// Result file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResult {
    pub video_id: VideoId,
    pub processed_at: DateTime<Utc>,
    pub result: Value,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist the result for a video. Saving again replaces the previous result.
    async fn save(&self, video_id: &VideoId, result: &Value) -> WorkerResult<PathBuf>;
}

/// Writes one `{video_id}.json` file per video into a directory.
#[derive(Debug, Clone)]
pub struct LocalResultStore {
    dir: PathBuf,
}

impl LocalResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, video_id: &VideoId) -> PathBuf {
        let name = normalize_job_name(video_id.as_str());
        let name = if name.is_empty() { "unknown".to_string() } else { name };
        self.dir.join(format!("{}.json", name))
    }
}

#[async_trait]
impl ResultStore for LocalResultStore {
    async fn save(&self, video_id: &VideoId, result: &Value) -> WorkerResult<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let record = StoredResult {
            video_id: video_id.clone(),
            processed_at: Utc::now(),
            result: result.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        // Write then rename, so readers never see a partial file.
        let path = self.path_for(video_id);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!(video_id = %video_id, path = %path.display(), "Saved analysis result");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_save_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path().join("results"));

        let path = store
            .save(&VideoId::from("103"), &json!({"persons": 2}))
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("results").join("103.json"));

        let stored: StoredResult =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(stored.video_id, VideoId::from("103"));
        assert_eq!(stored.result, json!({"persons": 2}));
    }

    #[tokio::test]
    async fn test_save_is_idempotent_per_video() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalResultStore::new(dir.path());

        store.save(&VideoId::from("7"), &json!({"v": 1})).await.unwrap();
        let path = store.save(&VideoId::from("7"), &json!({"v": 2})).await.unwrap();

        let stored: StoredResult =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(stored.result, json!({"v": 2}));

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut count = 0;
        while entries.next_entry().await.unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_path_is_sanitized() {
        let store = LocalResultStore::new("/results");
        assert_eq!(
            store.path_for(&VideoId::from("../etc/passwd")),
            PathBuf::from("/results/etc-passwd.json")
        );
    }
}
