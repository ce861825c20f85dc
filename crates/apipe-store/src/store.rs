//! Job store contract.

use apipe_models::{Job, JobId, JobState, ProcessingResult};
use async_trait::async_trait;

use crate::error::StoreResult;

/// Outcome of an idempotent insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The job was stored
    Created(Job),
    /// A live job already owns the idempotency key
    Existing(Job),
}

impl InsertOutcome {
    pub fn job(&self) -> &Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Existing(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            InsertOutcome::Created(job) | InsertOutcome::Existing(job) => job,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, InsertOutcome::Created(_))
    }
}

/// Durable job records and results.
///
/// Every write goes through a compare-and-set on `(state, version)`; the
/// store bumps `version` and returns the record as written. Callers never
/// overwrite a record they did not read.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Store `job` unless a job that still owns its idempotency key exists,
    /// in which case that job is returned. Atomic per key.
    async fn insert_or_get(&self, job: Job) -> StoreResult<InsertOutcome>;

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>>;

    /// The job currently owning `key`, if any.
    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>>;

    async fn list_by_state(&self, state: JobState) -> StoreResult<Vec<Job>>;

    /// Write `job` if the stored record is still in `expected_state` at
    /// `job.version`. Entering DeadLettered or Cancelled releases the
    /// idempotency key.
    async fn compare_and_set(&self, job: &Job, expected_state: JobState) -> StoreResult<Job>;

    /// Atomically move the job from Processing to Succeeded (as given in
    /// `job`) and store its immutable result.
    async fn publish_result(&self, job: &Job, result: ProcessingResult) -> StoreResult<Job>;

    async fn get_result(&self, job_id: &JobId) -> StoreResult<Option<ProcessingResult>>;
}
