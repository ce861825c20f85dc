//! Audio engine contract.

use std::sync::Arc;

use apipe_models::{AudioFormat, Metrics, OperationSpec, PayloadRef};
use async_trait::async_trait;

use crate::error::EngineResult;

/// Source audio handed to an engine.
#[derive(Debug, Clone)]
pub struct AudioInput {
    /// Where the bytes came from (used to infer the source format)
    pub payload: PayloadRef,
    pub bytes: Vec<u8>,
}

impl AudioInput {
    pub fn new(payload: PayloadRef, bytes: Vec<u8>) -> Self {
        Self { payload, bytes }
    }

    /// Format implied by the payload key's extension, falling back to WAV.
    pub fn source_format(&self) -> AudioFormat {
        self.payload
            .key()
            .rsplit_once('.')
            .and_then(|(_, ext)| ext.parse().ok())
            .unwrap_or(AudioFormat::Wav)
    }
}

/// What an engine produced for one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    /// Processed audio, `None` for measurement-only operations
    pub audio: Option<Vec<u8>>,
    /// Format of `audio`
    pub format: Option<AudioFormat>,
    pub metrics: Metrics,
}

impl EngineOutput {
    pub fn audio(bytes: Vec<u8>, format: AudioFormat, metrics: Metrics) -> Self {
        Self {
            audio: Some(bytes),
            format: Some(format),
            metrics,
        }
    }

    pub fn metrics_only(metrics: Metrics) -> Self {
        Self {
            audio: None,
            format: None,
            metrics,
        }
    }

    /// File extension for the processed audio.
    pub fn extension(&self) -> Option<&'static str> {
        self.format.map(|f| f.extension())
    }

    pub fn content_type(&self) -> Option<&'static str> {
        self.format.map(|f| f.content_type())
    }
}

/// Pure transform from (audio, operation) to output.
///
/// Implementations must be deterministic for a given `version()`: the same
/// bytes and operation yield equivalent output. Nothing partial may be
/// observable when `process` fails.
#[async_trait]
pub trait AudioEngine: Send + Sync {
    /// Identifies the implementation revision. Part of cache keys and results.
    fn version(&self) -> &str;

    async fn process(&self, input: &AudioInput, op: &OperationSpec) -> EngineResult<EngineOutput>;
}

#[async_trait]
impl<E: AudioEngine + ?Sized> AudioEngine for Arc<E> {
    fn version(&self) -> &str {
        (**self).version()
    }

    async fn process(&self, input: &AudioInput, op: &OperationSpec) -> EngineResult<EngineOutput> {
        (**self).process(input, op).await
    }
}
