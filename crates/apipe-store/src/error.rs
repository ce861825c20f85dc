//! Store error types.

use apipe_models::{ErrorKind, JobState};
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Write conflict on job {job_id}: expected {expected} (v{expected_version}), found {actual} (v{actual_version})")]
    Conflict {
        job_id: String,
        expected: JobState,
        expected_version: u64,
        actual: JobState,
        actual_version: u64,
    },

    #[error("Result already published for job {0}")]
    ResultExists(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Unexpected store response: {0}")]
    InvalidResponse(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Self::InvalidResponse(msg.into())
    }

    /// Another writer changed the record first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::ResultExists(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) | StoreError::Conflict { .. } | StoreError::ResultExists(_) => {
                ErrorKind::ConsistencyViolation
            }
            StoreError::ConnectionFailed(_)
            | StoreError::InvalidResponse(_)
            | StoreError::Redis(_)
            | StoreError::Json(_) => ErrorKind::TransientIo,
        }
    }
}
