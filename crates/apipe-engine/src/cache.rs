//! Result cache for engine outputs.

use std::collections::{HashMap, VecDeque};

use apipe_models::{AudioFormat, OperationSpec};
use async_trait::async_trait;
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::{AudioEngine, AudioInput, EngineOutput};
use crate::error::EngineResult;

/// Counter incremented on every cache hit.
pub const CACHE_HITS_METRIC: &str = "apipe_engine_cache_hits_total";

/// Default budget for retained outputs (256 MiB).
pub const DEFAULT_CACHE_MAX_BYTES: usize = 256 * 1024 * 1024;

/// Charged per entry on top of its audio, for the key and metrics.
const ENTRY_OVERHEAD_BYTES: usize = 512;

/// Identity of one engine invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub input_sha256: String,
    /// Output codec follows the source format, so it is part of the identity
    pub source_format: AudioFormat,
    pub operation: String,
    pub engine_version: String,
}

impl CacheKey {
    pub fn new(input: &AudioInput, op: &OperationSpec, engine_version: &str) -> Self {
        Self {
            input_sha256: format!("{:x}", Sha256::digest(&input.bytes)),
            source_format: input.source_format(),
            operation: op.canonical_json(),
            engine_version: engine_version.to_string(),
        }
    }
}

fn entry_cost(output: &EngineOutput) -> usize {
    ENTRY_OVERHEAD_BYTES + output.audio.as_ref().map_or(0, Vec::len)
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, EngineOutput>,
    // Insertion order for eviction
    order: VecDeque<CacheKey>,
    bytes: usize,
}

impl CacheState {
    fn remove(&mut self, key: &CacheKey) {
        if let Some(old) = self.entries.remove(key) {
            self.bytes -= entry_cost(&old);
        }
    }
}

/// Engine decorator that retains outputs by content hash.
///
/// A hit returns the stored output without calling the inner engine, which
/// keeps redelivered jobs from doing the work twice. Failures are never
/// cached. Retained outputs are bounded by total size; the oldest go first
/// and an output larger than the whole budget is not kept.
pub struct CachedEngine<E> {
    inner: E,
    max_bytes: usize,
    state: Mutex<CacheState>,
}

impl<E: AudioEngine> CachedEngine<E> {
    pub fn new(inner: E) -> Self {
        Self::with_max_bytes(inner, DEFAULT_CACHE_MAX_BYTES)
    }

    pub fn with_max_bytes(inner: E, max_bytes: usize) -> Self {
        Self {
            inner,
            max_bytes,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Number of retained outputs.
    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Bytes charged against the budget.
    pub async fn size_bytes(&self) -> usize {
        self.state.lock().await.bytes
    }

    async fn retain(&self, key: CacheKey, output: &EngineOutput) {
        let cost = entry_cost(output);
        if cost > self.max_bytes {
            debug!(input_sha256 = %key.input_sha256, cost, "Output exceeds cache budget, not retained");
            return;
        }

        let mut state = self.state.lock().await;
        // Concurrent misses for the same key both compute; the later one wins
        if state.entries.contains_key(&key) {
            state.remove(&key);
            state.order.retain(|k| k != &key);
        }
        while state.bytes + cost > self.max_bytes {
            match state.order.pop_front() {
                Some(oldest) => state.remove(&oldest),
                None => break,
            }
        }
        state.bytes += cost;
        state.order.push_back(key.clone());
        state.entries.insert(key, output.clone());
    }
}

#[async_trait]
impl<E: AudioEngine> AudioEngine for CachedEngine<E> {
    fn version(&self) -> &str {
        self.inner.version()
    }

    async fn process(&self, input: &AudioInput, op: &OperationSpec) -> EngineResult<EngineOutput> {
        let key = CacheKey::new(input, op, self.inner.version());

        if let Some(hit) = self.state.lock().await.entries.get(&key) {
            debug!(op = op.kind(), input_sha256 = %key.input_sha256, "Engine cache hit");
            counter!(CACHE_HITS_METRIC).increment(1);
            return Ok(hit.clone());
        }

        // Lock is not held across the inner call
        let output = self.inner.process(input, op).await?;
        self.retain(key, &output).await;

        Ok(output)
    }
}
