//! S3 integration tests.

use vproc_models::S3Location;
use vproc_storage::{ObjectStore, S3Store, StorageError};

fn test_bucket() -> String {
    std::env::var("TEST_S3_BUCKET").unwrap_or_else(|_| "test-bucket".to_string())
}

/// Test download of a missing object maps to NotFound.
#[tokio::test]
#[ignore = "requires S3"]
async fn test_missing_object_is_not_found() {
    dotenvy::dotenv().ok();

    let store = S3Store::from_env().await;
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let location = S3Location::new(test_bucket(), "videos/0/does-not-exist.mp4");

    let err = store
        .download_to(&location, &dir.path().join("source.mp4"))
        .await
        .expect_err("download should fail");

    assert!(matches!(err, StorageError::NotFound(_)));
    assert_eq!(err.code(), Some("NoSuchKey"));
    assert!(!store.exists(&location).await.expect("head failed"));
}

/// Test bucket connectivity.
#[tokio::test]
#[ignore = "requires S3"]
async fn test_check_connectivity() {
    dotenvy::dotenv().ok();

    let store = S3Store::from_env().await;
    store
        .check_connectivity(&test_bucket())
        .await
        .expect("Bucket not reachable");
}
