//! Error types for audio engine operations.

use apipe_models::{ErrorKind, OperationSpecError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur while processing audio.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("FFmpeg not found in PATH")]
    FfmpegNotFound,

    #[error("FFprobe not found in PATH")]
    FfprobeNotFound,

    #[error("FFmpeg command failed: {message}")]
    FfmpegFailed {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    #[error("FFprobe command failed: {message}")]
    FfprobeFailed {
        message: String,
        stderr: Option<String>,
    },

    #[error("Invalid operation: {0}")]
    InvalidOperation(#[from] OperationSpecError),

    #[error("Undecodable audio: {0}")]
    InvalidAudio(String),

    #[error("Engine failure: {0}")]
    Failed(String),

    #[error("Operation timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl EngineError {
    /// Create an FFmpeg failure error.
    pub fn ffmpeg_failed(
        message: impl Into<String>,
        stderr: Option<String>,
        exit_code: Option<i32>,
    ) -> Self {
        Self::FfmpegFailed {
            message: message.into(),
            stderr,
            exit_code,
        }
    }

    /// Create a generic engine failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create an undecodable-input error.
    pub fn invalid_audio(message: impl Into<String>) -> Self {
        Self::InvalidAudio(message.into())
    }

    /// Failure classification used by the retry decision.
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            EngineError::Io(_) => ErrorKind::TransientIo,
            EngineError::FfmpegNotFound
            | EngineError::FfprobeNotFound
            | EngineError::FfmpegFailed { .. }
            | EngineError::FfprobeFailed { .. }
            | EngineError::InvalidAudio(_)
            | EngineError::Failed(_)
            | EngineError::Timeout(_)
            | EngineError::JsonParse(_) => ErrorKind::EngineFailure,
        }
    }
}
