//! Job submission, cancellation and the retry decision.
//!
//! The dispatcher owns every persisted transition that is not part of a
//! worker's happy path: job creation, cancellation, and what happens to a
//! job after an attempt failed. All writes go through the store's
//! compare-and-set and publish a [`JobEvent`].

use std::sync::Arc;
use std::time::Duration;

use apipe_models::{
    ErrorKind, Job, JobEvent, JobId, JobState, OperationSpec, PayloadRef, Priority,
    ProcessingResult, DEFAULT_MAX_ATTEMPTS,
};
use apipe_queue::{Lease, LeaseToken, QueueBroker, QueueDepth};
use apipe_store::{EventSink, InsertOutcome, JobStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{WorkerError, WorkerResult};
use crate::metrics;
use crate::retry::BackoffPolicy;

/// Compare-and-set retries for a write racing a cancel.
const CAS_RETRIES: usize = 5;

/// A request to run one operation on one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub payload: PayloadRef,
    pub operation: OperationSpec,
    /// Derived from payload and operation when absent
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub priority: Priority,
}

impl SubmitRequest {
    pub fn new(payload: PayloadRef, operation: OperationSpec) -> Self {
        Self {
            payload,
            operation,
            idempotency_key: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub job_id: JobId,
    /// `false` when an existing job owned the idempotency key
    pub created: bool,
}

/// What a caller polling a job sees.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub job: Job,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ProcessingResult>,
}

/// Outcome of the retry decision for one failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// Back to Queued, visible again after `delay`
    Retried { delay: Duration },
    DeadLettered,
    /// A cancel recorded during the attempt was honored
    Cancelled,
}

/// Enqueues jobs and applies dedup, cancellation and retry policy.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn QueueBroker>,
    events: Arc<dyn EventSink>,
    backoff: BackoffPolicy,
    max_attempts: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        broker: Arc<dyn QueueBroker>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            broker,
            events,
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn broker(&self) -> &Arc<dyn QueueBroker> {
        &self.broker
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Create a job, or return the live job that already owns the key.
    pub async fn submit(&self, request: SubmitRequest) -> WorkerResult<Submission> {
        request.operation.validate()?;

        let op = request.operation.kind();
        let job = Job::new(
            request.payload,
            request.operation,
            request.idempotency_key,
            request.priority,
        )
        .with_max_attempts(self.max_attempts);

        match self.store.insert_or_get(job).await? {
            InsertOutcome::Created(job) => {
                self.publish_event(&job).await;
                self.broker.enqueue(&job.id, job.priority).await?;
                metrics::record_submitted(op);
                info!(
                    job_id = %job.id,
                    op,
                    priority = %job.priority,
                    key = %job.idempotency_key,
                    "Job submitted"
                );
                Ok(Submission {
                    job_id: job.id,
                    created: true,
                })
            }
            InsertOutcome::Existing(job) => {
                metrics::record_deduplicated(op);
                debug!(job_id = %job.id, state = %job.state, key = %job.idempotency_key, "Duplicate submission");

                // A crash between insert and enqueue leaves a Queued record
                // the broker never saw
                if job.state == JobState::Queued && !self.broker.contains(&job.id).await? {
                    warn!(job_id = %job.id, "Queued job missing from broker, re-enqueueing");
                    self.broker.enqueue(&job.id, job.priority).await?;
                }

                Ok(Submission {
                    job_id: job.id,
                    created: false,
                })
            }
        }
    }

    /// Cancel a job, or record the request when it is mid-attempt.
    ///
    /// Returns the state the job is in afterwards: Cancelled for Queued and
    /// Leased jobs, unchanged (with the flag set) for Processing and Failed
    /// jobs, unchanged for terminal jobs.
    pub async fn cancel(&self, job_id: &JobId) -> WorkerResult<JobState> {
        for _ in 0..CAS_RETRIES {
            let mut job = self.load(job_id).await?;
            let expected = job.state;

            match expected {
                JobState::Queued | JobState::Leased => {
                    job.cancel()?;
                }
                JobState::Processing | JobState::Failed => {
                    if job.cancel_requested {
                        return Ok(expected);
                    }
                    job.request_cancel();
                }
                JobState::Succeeded | JobState::DeadLettered | JobState::Cancelled => {
                    return Ok(expected);
                }
            }

            match self.persist(&job, expected).await {
                Ok(written) => {
                    if written.state == JobState::Cancelled {
                        metrics::record_cancelled();
                        info!(job_id = %job_id, "Job cancelled");
                    } else {
                        info!(job_id = %job_id, state = %written.state, "Cancellation recorded");
                    }
                    return Ok(written.state);
                }
                Err(e) if e.is_conflict() => {
                    debug!(job_id = %job_id, "Cancel raced another writer, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        Err(WorkerError::Contended(job_id.to_string()))
    }

    /// Job record plus its result, for polling callers.
    pub async fn status(&self, job_id: &JobId) -> WorkerResult<JobStatus> {
        let job = self.load(job_id).await?;
        let result = self.store.get_result(job_id).await?;
        Ok(JobStatus { job, result })
    }

    /// Dead-lettered jobs, kept for operator inspection.
    pub async fn dead_letters(&self) -> WorkerResult<Vec<Job>> {
        Ok(self.store.list_by_state(JobState::DeadLettered).await?)
    }

    pub async fn queue_depth(&self) -> WorkerResult<QueueDepth> {
        let depth = self.broker.depth().await?;
        metrics::set_queue_depth(&depth);
        Ok(depth)
    }

    /// Re-enqueue Queued jobs the broker lost track of.
    ///
    /// Returns how many were re-enqueued.
    pub async fn recover_orphans(&self) -> WorkerResult<usize> {
        let mut recovered = 0;
        for job in self.store.list_by_state(JobState::Queued).await? {
            if !self.broker.contains(&job.id).await? {
                self.broker.enqueue(&job.id, job.priority).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            warn!(recovered, "Re-enqueued Queued jobs missing from broker");
        }
        Ok(recovered)
    }

    /// Decide what happens to a job whose attempt failed.
    ///
    /// `job` must be in Failed with `last_error` set. This is the one place
    /// the retry-or-dead-letter decision is made. When the record changed
    /// since `job` was read (a cancel landing on Failed), the decision is
    /// made again from the stored copy.
    pub async fn handle_failure(&self, job: Job, lease: &Lease) -> WorkerResult<FailureDecision> {
        let mut job = job;
        for _ in 0..CAS_RETRIES {
            match self.decide_failure(job.clone(), lease).await {
                Err(e) if e.is_conflict() => {
                    let current = self.load(&job.id).await?;
                    if current.state != JobState::Failed {
                        return Err(e);
                    }
                    debug!(job_id = %job.id, "Failed job changed before the decision, retrying");
                    job = current;
                }
                decided => return decided,
            }
        }

        Err(WorkerError::Contended(job.id.to_string()))
    }

    async fn decide_failure(&self, mut job: Job, lease: &Lease) -> WorkerResult<FailureDecision> {
        let kind = job
            .last_error
            .as_ref()
            .map(|e| e.kind)
            .unwrap_or(ErrorKind::EngineFailure);
        let op = job.operation.kind();

        if job.cancel_requested {
            job.requeue()?;
            let mut queued = self.persist(&job, JobState::Failed).await?;
            queued.cancel()?;
            self.persist(&queued, JobState::Queued).await?;
            self.ack(&lease.token, &job.id).await;
            metrics::record_cancelled();
            info!(job_id = %job.id, "Cancellation honored after failed attempt");
            return Ok(FailureDecision::Cancelled);
        }

        if !kind.is_retryable() || job.attempts_exhausted() {
            job.dead_letter()?;
            let written = self.persist(&job, JobState::Failed).await?;
            self.ack(&lease.token, &job.id).await;
            metrics::record_dead_lettered(kind);
            error!(
                job_id = %job.id,
                op,
                kind = %kind,
                attempts = written.attempts,
                max_attempts = written.max_attempts,
                "Job dead-lettered"
            );
            return Ok(FailureDecision::DeadLettered);
        }

        let delay = self.backoff.delay_for_attempt(job.attempts);
        job.requeue()?;
        let written = self.persist(&job, JobState::Failed).await?;
        if let Err(e) = self.broker.nack(&lease.token, delay).await {
            // The reference comes back on its own once the lease expires
            warn!(job_id = %job.id, "Failed to nack job: {}", e);
        }
        metrics::record_retried(op);
        info!(
            job_id = %job.id,
            op,
            kind = %kind,
            attempt = written.attempts,
            max_attempts = written.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "Job will be retried"
        );
        Ok(FailureDecision::Retried { delay })
    }

    /// Compare-and-set `job` against `expected` and publish the change.
    pub async fn persist(&self, job: &Job, expected: JobState) -> WorkerResult<Job> {
        let written = self.store.compare_and_set(job, expected).await?;
        self.publish_event(&written).await;
        Ok(written)
    }

    /// Publish the result and Succeeded in one store write.
    pub async fn complete(&self, job: &Job, result: ProcessingResult) -> WorkerResult<Job> {
        let written = self.store.publish_result(job, result).await?;
        self.publish_event(&written).await;
        Ok(written)
    }

    /// Remove a settled reference from the broker.
    pub async fn ack(&self, token: &LeaseToken, job_id: &JobId) {
        if let Err(e) = self.broker.ack(token).await {
            // A lost lease redelivers a terminal job, which is acked on sight
            warn!(job_id = %job_id, "Failed to ack job: {}", e);
        }
    }

    async fn load(&self, job_id: &JobId) -> WorkerResult<Job> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| WorkerError::job_not_found(job_id.as_str()))
    }

    async fn publish_event(&self, job: &Job) {
        if let Err(e) = self.events.publish(&JobEvent::from_job(job)).await {
            warn!(job_id = %job.id, "Failed to publish job event: {}", e);
        }
    }
}
