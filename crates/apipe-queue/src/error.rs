//! Queue error types.

use apipe_models::ErrorKind;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Enqueue failed: {0}")]
    EnqueueFailed(String),

    #[error("Lease not found or expired: {0}")]
    LeaseNotFound(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn enqueue_failed(msg: impl Into<String>) -> Self {
        Self::EnqueueFailed(msg.into())
    }

    pub fn lease_not_found(token: impl Into<String>) -> Self {
        Self::LeaseNotFound(token.into())
    }

    /// The lease was lost (expired or already settled).
    pub fn is_lease_lost(&self) -> bool {
        matches!(self, QueueError::LeaseNotFound(_))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::LeaseNotFound(_) => ErrorKind::LeaseExpired,
            _ => ErrorKind::TransientIo,
        }
    }
}
