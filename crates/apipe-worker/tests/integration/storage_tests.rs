//! S3 payload store integration tests.

use apipe_models::PayloadRef;
use apipe_storage::{export_key, PayloadStore, S3PayloadStore};

/// Put, fetch and delete one object.
#[tokio::test]
#[ignore = "requires S3 credentials"]
async fn test_s3_put_fetch_delete() {
    dotenvy::dotenv().ok();

    let store = S3PayloadStore::from_env().expect("Failed to create S3 store");
    let key = export_key(&format!("integration-{}", uuid::Uuid::new_v4()), 1, "wav");

    let stored = store
        .put(&key, b"Integration test content".to_vec(), "audio/wav")
        .await
        .expect("Failed to put object");
    assert_eq!(stored.key(), key);

    let bytes = store.fetch(&stored).await.expect("Failed to fetch object");
    assert_eq!(bytes, b"Integration test content");

    store.delete(&stored).await.expect("Failed to delete object");
    let err = store.fetch(&stored).await.unwrap_err();
    assert!(err.is_not_found());

    // Deleting twice is fine
    store.delete(&stored).await.expect("Second delete failed");
}

/// A missing object maps to not-found.
#[tokio::test]
#[ignore = "requires S3 credentials"]
async fn test_s3_missing_object() {
    dotenvy::dotenv().ok();

    let store = S3PayloadStore::from_env().expect("Failed to create S3 store");
    let missing = PayloadRef::new(format!("uploads/missing-{}.wav", uuid::Uuid::new_v4()));

    let err = store.fetch(&missing).await.unwrap_err();
    assert!(err.is_not_found());
}
