//! S3 client implementation.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use vproc_models::S3Location;

use crate::error::{StorageError, StorageResult};

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// AWS region
    pub region: String,
    /// Custom endpoint (LocalStack)
    pub endpoint_url: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            region: "ap-northeast-2".to_string(),
            endpoint_url: None,
        }
    }
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let region = std::env::var("AWS_S3_REGION")
            .or_else(|_| std::env::var("AWS_REGION"))
            .unwrap_or_else(|_| "ap-northeast-2".to_string());

        let use_localstack = std::env::var("USE_LOCALSTACK")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let endpoint_url = use_localstack.then(|| {
            std::env::var("AWS_ENDPOINT_URL").unwrap_or_else(|_| "http://localhost:4566".to_string())
        });

        Self {
            region,
            endpoint_url,
        }
    }
}

/// Object storage operations the worker depends on.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Download an object to a local file, returning the bytes written.
    async fn download_to(&self, location: &S3Location, path: &Path) -> StorageResult<u64>;
}

/// S3 storage client.
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    /// Create a new S3 client from configuration.
    pub async fn new(config: StorageConfig) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region));

        if let Some(endpoint) = &config.endpoint_url {
            let credentials = Credentials::new(
                std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_else(|_| "test".to_string()),
                std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_else(|_| "test".to_string()),
                None,
                None,
                "localstack",
            );
            loader = loader.endpoint_url(endpoint).credentials_provider(credentials);
            info!("Using LocalStack S3 endpoint: {}", endpoint);
        }

        let sdk_config = loader.load().await;

        // LocalStack only serves path-style addressing.
        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint_url.is_some())
            .build();

        Self {
            client: Client::from_conf(s3_config),
        }
    }

    /// Create from environment variables.
    pub async fn from_env() -> Self {
        Self::new(StorageConfig::from_env()).await
    }

    /// Size of an object in bytes.
    pub async fn object_size(&self, location: &S3Location) -> StorageResult<u64> {
        let response = self
            .client
            .head_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk("HeadObject", &location.key, e))?;

        Ok(response.content_length().unwrap_or(0).max(0) as u64)
    }

    /// Check if an object exists.
    pub async fn exists(&self, location: &S3Location) -> StorageResult<bool> {
        match self.object_size(location).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check connectivity by performing a head bucket operation.
    pub async fn check_connectivity(&self, bucket: &str) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk("HeadBucket", bucket, e))?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn download_to(&self, location: &S3Location, path: &Path) -> StorageResult<u64> {
        if location.key.is_empty() {
            return Err(StorageError::InvalidKey(location.uri()));
        }
        debug!("Downloading {} to {}", location.uri(), path.display());

        let response = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(&location.key)
            .send()
            .await
            .map_err(|e| StorageError::from_sdk("GetObject", &location.key, e))?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut body = response.body;
        let mut written = 0u64;

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| StorageError::network("GetObject", e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!("Downloaded {} to {} ({} bytes)", location.uri(), path.display(), written);
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_endpoint() {
        let config = StorageConfig::default();
        assert!(config.endpoint_url.is_none());
        assert_eq!(config.region, "ap-northeast-2");
    }
}
