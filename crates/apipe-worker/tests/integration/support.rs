//! Shared fixtures: a scriptable engine, an in-memory payload store and a
//! wired-up pipeline.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use apipe_engine::{AudioEngine, AudioInput, EngineError, EngineOutput, EngineResult};
use apipe_models::{Job, JobId, JobState, MetricValue, Metrics, OperationSpec, PayloadRef};
use apipe_queue::{InMemoryBroker, QueueBroker, QueueConfig};
use apipe_storage::{
    LocalPayloadStore, PayloadStore, StorageError, StorageResult, EXPORTS_PREFIX,
};
use apipe_store::{BroadcastEvents, JobStore, MemoryJobStore};
use apipe_worker::{
    process_lease, BackoffPolicy, Dispatcher, LeaseOutcome, ProcessingContext, WorkerConfig,
    WorkerPool,
};
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Semaphore;

pub const ENGINE_VERSION: &str = "fake-engine/1";

/// Engine double: reverses the input bytes and reports fixed metrics.
///
/// Can be told to fail, panic, or block on a gate for a number of calls.
pub struct FakeEngine {
    calls: AtomicUsize,
    failures_left: AtomicUsize,
    panics_left: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    seen: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
            panics_left: AtomicUsize::new(0),
            gate: None,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next `times` calls with an engine failure.
    pub fn failing(self, times: usize) -> Self {
        self.failures_left.store(times, Ordering::SeqCst);
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing(usize::MAX)
    }

    /// Panic on the next `times` calls.
    pub fn panicking(self, times: usize) -> Self {
        self.panics_left.store(times, Ordering::SeqCst);
        self
    }

    /// Block every call until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Payload keys in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

#[async_trait]
impl AudioEngine for FakeEngine {
    fn version(&self) -> &str {
        ENGINE_VERSION
    }

    async fn process(&self, input: &AudioInput, op: &OperationSpec) -> EngineResult<EngineOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(input.payload.key().to_string());

        if Self::take(&self.panics_left) {
            panic!("engine crashed");
        }
        if let Some(gate) = &self.gate {
            let _permit = gate.acquire().await;
        }
        if Self::take(&self.failures_left) {
            return Err(EngineError::failed("synthetic engine failure"));
        }

        let mut metrics = Metrics::new();
        metrics.insert("durationMs".to_string(), MetricValue::from(1200i64));
        metrics.insert("sampleRate".to_string(), MetricValue::from(48_000i64));
        metrics.insert("op".to_string(), MetricValue::from(op.kind()));

        if op.produces_audio() {
            let processed: Vec<u8> = input.bytes.iter().rev().copied().collect();
            Ok(EngineOutput::audio(processed, input.source_format(), metrics))
        } else {
            Ok(EngineOutput::metrics_only(metrics))
        }
    }
}

/// Payload store held in a map.
///
/// Export uploads can be held on a gate to stretch an attempt past its lease.
#[derive(Default)]
pub struct MemoryPayloads {
    objects: tokio::sync::Mutex<HashMap<String, Vec<u8>>>,
    export_gate: Option<Arc<Semaphore>>,
    held_exports: AtomicUsize,
}

impl MemoryPayloads {
    /// Hold the next `times` export uploads until a permit is added to `gate`.
    pub fn holding_exports(mut self, gate: Arc<Semaphore>, times: usize) -> Self {
        self.export_gate = Some(gate);
        self.held_exports.store(times, Ordering::SeqCst);
        self
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloads {
    async fn fetch(&self, payload: &PayloadRef) -> StorageResult<Vec<u8>> {
        self.objects
            .lock()
            .await
            .get(payload.key())
            .cloned()
            .ok_or_else(|| StorageError::not_found(payload.key()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> StorageResult<PayloadRef> {
        if let Some(gate) = &self.export_gate {
            if key.starts_with(EXPORTS_PREFIX) && FakeEngine::take(&self.held_exports) {
                let _permit = gate.acquire().await;
            }
        }
        self.objects.lock().await.insert(key.to_string(), bytes);
        Ok(PayloadRef::new(key))
    }

    async fn delete(&self, payload: &PayloadRef) -> StorageResult<()> {
        self.objects.lock().await.remove(payload.key());
        Ok(())
    }
}

/// Knobs for a test pipeline.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub concurrency: usize,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub visibility_timeout: Duration,
    pub job_timeout: Duration,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(10),
            job_timeout: Duration::from_secs(5),
        }
    }
}

impl TestConfig {
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            worker_name: "test-worker".to_string(),
            concurrency: self.concurrency,
            lease_wait: Duration::from_millis(50),
            job_timeout: self.job_timeout,
            shutdown_timeout: Duration::from_secs(5),
            max_attempts: self.max_attempts,
            retry_base_delay: self.base_delay,
            retry_max_delay: self.max_delay,
            error_backoff: Duration::from_millis(50),
            queue: QueueConfig {
                visibility_timeout: self.visibility_timeout,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Dispatcher, broker, store and payloads wired together in memory.
pub struct Pipeline {
    pub dispatcher: Arc<Dispatcher>,
    pub broker: Arc<InMemoryBroker>,
    pub store: Arc<MemoryJobStore>,
    pub payloads: Arc<dyn PayloadStore>,
    pub events: BroadcastEvents,
    pub ctx: Arc<ProcessingContext>,
    _dir: Option<TempDir>,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn AudioEngine>) -> Self {
        Self::with_config(engine, TestConfig::default())
    }

    pub fn with_config(engine: Arc<dyn AudioEngine>, config: TestConfig) -> Self {
        Self::build(engine, config, Arc::new(MemoryPayloads::default()), None)
    }

    /// Pipeline over a payload store the test keeps a handle to.
    pub fn with_payloads(
        engine: Arc<dyn AudioEngine>,
        config: TestConfig,
        payloads: Arc<MemoryPayloads>,
    ) -> Self {
        Self::build(engine, config, payloads, None)
    }

    /// Pipeline whose payloads live on disk under a temporary directory.
    pub fn with_local_storage(engine: Arc<dyn AudioEngine>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let payloads = Arc::new(LocalPayloadStore::with_root(dir.path()));
        Self::build(engine, TestConfig::default(), payloads, Some(dir))
    }

    fn build(
        engine: Arc<dyn AudioEngine>,
        config: TestConfig,
        payloads: Arc<dyn PayloadStore>,
        dir: Option<TempDir>,
    ) -> Self {
        let broker = Arc::new(InMemoryBroker::new());
        let store = Arc::new(MemoryJobStore::new());
        let events = BroadcastEvents::new(256);
        let worker_config = config.worker_config();

        let dispatcher = Arc::new(
            Dispatcher::new(store.clone(), broker.clone(), Arc::new(events.clone()))
                .with_backoff(BackoffPolicy::from_config(&worker_config))
                .with_max_attempts(worker_config.max_attempts),
        );
        let ctx = Arc::new(ProcessingContext::new(
            worker_config,
            Arc::clone(&dispatcher),
            Arc::clone(&payloads),
            engine,
        ));

        Self {
            dispatcher,
            broker,
            store,
            payloads,
            events,
            ctx,
            _dir: dir,
        }
    }

    pub async fn upload(&self, key: &str, bytes: &[u8]) -> PayloadRef {
        self.payloads.put(key, bytes.to_vec(), "audio/wav").await.unwrap()
    }

    pub fn pool(&self) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(Arc::clone(&self.ctx)))
    }

    pub async fn job(&self, id: &JobId) -> Job {
        self.store.get(id).await.unwrap().unwrap()
    }

    /// Lease the next job (waiting for it if needed) and process it the
    /// way an executor would.
    pub async fn drive_one(&self, worker_id: &str) -> Option<LeaseOutcome> {
        let lease = self
            .broker
            .lease(
                worker_id,
                self.ctx.config.visibility_timeout(),
                Some(Duration::from_secs(30)),
            )
            .await
            .unwrap()?;
        Some(process_lease(&self.ctx, lease).await)
    }

    pub async fn wait_for_state(&self, id: &JobId, state: JobState) -> Job {
        for _ in 0..500 {
            let job = self.job(id).await;
            if job.state == state {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = self.job(id).await;
        panic!("job {} stuck in {} waiting for {}", id, job.state, state);
    }
}
