//! Worker error types.

use apipe_engine::EngineError;
use apipe_models::{ErrorKind, OperationSpecError, TransitionError};
use apipe_queue::QueueError;
use apipe_storage::StorageError;
use apipe_store::StoreError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(#[from] OperationSpecError),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {0} kept changing under concurrent writers")]
    Contended(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn job_not_found(id: impl Into<String>) -> Self {
        Self::JobNotFound(id.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Another writer changed the job record first.
    pub fn is_conflict(&self) -> bool {
        matches!(self, WorkerError::Store(e) if e.is_conflict())
    }

    /// Classify the failure. This is the only place a kind is decided.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WorkerError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            WorkerError::JobNotFound(_)
            | WorkerError::Contended(_)
            | WorkerError::Transition(_) => ErrorKind::ConsistencyViolation,
            WorkerError::Engine(e) => e.kind(),
            WorkerError::Storage(e) => e.kind(),
            WorkerError::Queue(e) => e.kind(),
            WorkerError::Store(e) => e.kind(),
            WorkerError::Config(_) | WorkerError::Io(_) => ErrorKind::TransientIo,
        }
    }

    /// Check if error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}
