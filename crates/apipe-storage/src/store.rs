//! Payload storage contract.

use apipe_models::PayloadRef;
use async_trait::async_trait;

use crate::error::StorageResult;

/// Key prefix for source audio.
pub const UPLOADS_PREFIX: &str = "uploads/";

/// Key prefix for processed audio.
pub const EXPORTS_PREFIX: &str = "exports/";

/// Key for the processed audio of one attempt: `exports/{job_id}/{version}.{ext}`.
///
/// `version` is the job's version while Processing, which no other attempt
/// shares, so an attempt that loses the final write only ever removes its
/// own output.
pub fn export_key(job_id: &str, version: u64, extension: &str) -> String {
    format!("{}{}/{}.{}", EXPORTS_PREFIX, job_id, version, extension)
}

/// Resolves payload references to bytes and stores processed audio.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Read the bytes behind a reference.
    async fn fetch(&self, payload: &PayloadRef) -> StorageResult<Vec<u8>>;

    /// Write bytes under `key`. The object is visible only once complete.
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> StorageResult<PayloadRef>;

    /// Remove an object. Deleting a missing object is not an error.
    async fn delete(&self, payload: &PayloadRef) -> StorageResult<()>;
}
