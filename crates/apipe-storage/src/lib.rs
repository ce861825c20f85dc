//! Payload storage for the audio job pipeline.
//!
//! This crate provides:
//! - The `PayloadStore` contract (resolve references, write processed audio)
//! - A local filesystem store with separate uploads/exports directories
//! - An S3-compatible store (S3, R2, MinIO)

pub mod error;
pub mod local;
pub mod s3;
pub mod store;

use std::sync::Arc;

pub use error::{StorageError, StorageResult};
pub use local::LocalPayloadStore;
pub use s3::{S3Config, S3PayloadStore};
pub use store::{export_key, PayloadStore, EXPORTS_PREFIX, UPLOADS_PREFIX};

/// Pick a store from the environment: S3 when `S3_BUCKET` is set, local
/// directories otherwise.
pub fn payload_store_from_env() -> StorageResult<Arc<dyn PayloadStore>> {
    if S3Config::is_configured() {
        Ok(Arc::new(S3PayloadStore::from_env()?))
    } else {
        Ok(Arc::new(LocalPayloadStore::from_env()))
    }
}
