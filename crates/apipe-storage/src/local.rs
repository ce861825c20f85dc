//! Filesystem payload store.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use apipe_models::PayloadRef;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::store::{PayloadStore, EXPORTS_PREFIX, UPLOADS_PREFIX};

/// Default directory for source audio.
pub const DEFAULT_UPLOADS_DIR: &str = "data/uploads";

/// Default directory for processed audio.
pub const DEFAULT_EXPORTS_DIR: &str = "data/exports";

/// Payload store backed by two local directories.
///
/// Keys are `uploads/<name>` or `exports/<name>`; anything else, and any key
/// that would resolve outside its directory, is rejected.
#[derive(Debug, Clone)]
pub struct LocalPayloadStore {
    uploads_dir: PathBuf,
    exports_dir: PathBuf,
}

impl LocalPayloadStore {
    pub fn new(uploads_dir: impl Into<PathBuf>, exports_dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_dir: uploads_dir.into(),
            exports_dir: exports_dir.into(),
        }
    }

    /// Both directories under a single root.
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self::new(root.join("uploads"), root.join("exports"))
    }

    /// Create from `AUDIO_UPLOADS` / `AUDIO_EXPORTS`.
    pub fn from_env() -> Self {
        Self::new(
            std::env::var("AUDIO_UPLOADS").unwrap_or_else(|_| DEFAULT_UPLOADS_DIR.to_string()),
            std::env::var("AUDIO_EXPORTS").unwrap_or_else(|_| DEFAULT_EXPORTS_DIR.to_string()),
        )
    }

    pub fn uploads_dir(&self) -> &Path {
        &self.uploads_dir
    }

    pub fn exports_dir(&self) -> &Path {
        &self.exports_dir
    }

    /// Create both directories if missing.
    pub async fn ensure_dirs(&self) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.uploads_dir).await?;
        tokio::fs::create_dir_all(&self.exports_dir).await?;
        Ok(())
    }

    /// Store source audio under `uploads/<name>`.
    pub async fn upload(&self, name: &str, bytes: Vec<u8>) -> StorageResult<PayloadRef> {
        self.put(&format!("{}{}", UPLOADS_PREFIX, name), bytes, "application/octet-stream")
            .await
    }

    /// Map a key to a path inside the matching directory.
    pub fn resolve(&self, key: &str) -> StorageResult<PathBuf> {
        let (dir, rest) = if let Some(rest) = key.strip_prefix(UPLOADS_PREFIX) {
            (&self.uploads_dir, rest)
        } else if let Some(rest) = key.strip_prefix(EXPORTS_PREFIX) {
            (&self.exports_dir, rest)
        } else {
            return Err(StorageError::invalid_key(key));
        };

        let relative = Path::new(rest);
        let is_plain = !rest.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !is_plain {
            return Err(StorageError::invalid_key(key));
        }

        Ok(dir.join(relative))
    }
}

#[async_trait]
impl PayloadStore for LocalPayloadStore {
    async fn fetch(&self, payload: &PayloadRef) -> StorageResult<Vec<u8>> {
        let path = self.resolve(payload.key())?;
        debug!("Reading {}", path.display());

        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::not_found(payload.key()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> StorageResult<PayloadRef> {
        let path = self.resolve(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StorageError::invalid_key(key))?
            .to_path_buf();
        tokio::fs::create_dir_all(&parent).await?;

        // Each writer gets its own temp file; the rename is the commit point
        let len = bytes.len();
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut partial = tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(&parent)?;
            partial.write_all(&bytes)?;
            partial.as_file().sync_all()?;
            partial.persist(&path).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::upload_failed(e.to_string()))??;

        info!("Stored {} bytes at {}", len, key);
        Ok(PayloadRef::new(key))
    }

    async fn delete(&self, payload: &PayloadRef) -> StorageResult<()> {
        let path = self.resolve(payload.key())?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::delete_failed(e.to_string())),
        }
    }
}
