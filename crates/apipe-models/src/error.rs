//! Failure classification shared by the worker, dispatcher and API layer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::job::JobState;

/// Classified kind of a job failure.
///
/// The classification is made once, at the worker boundary, and decides
/// whether the failure is retried or dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Network/storage blip
    TransientIo,
    /// Malformed or unsupported operation spec
    InvalidOperation,
    /// Source audio could not be found or read
    PayloadUnavailable,
    /// The engine itself errored while processing
    EngineFailure,
    /// Unexpected state transition attempted
    ConsistencyViolation,
    /// The attempt was lost to a visibility timeout (crashed or stalled worker)
    LeaseExpired,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::InvalidOperation => "invalid_operation",
            ErrorKind::PayloadUnavailable => "payload_unavailable",
            ErrorKind::EngineFailure => "engine_failure",
            ErrorKind::ConsistencyViolation => "consistency_violation",
            ErrorKind::LeaseExpired => "lease_expired",
        }
    }

    /// Whether a failure of this kind goes back through the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::TransientIo
                | ErrorKind::PayloadUnavailable
                | ErrorKind::EngineFailure
                | ErrorKind::LeaseExpired
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last error recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A state transition that the job state machine does not allow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Illegal job transition: {from} -> {to}")]
pub struct TransitionError {
    pub from: JobState,
    pub to: JobState,
}
