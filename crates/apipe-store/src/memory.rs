//! In-process job store.

use std::collections::HashMap;

use apipe_models::{Job, JobId, JobState, ProcessingResult};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{InsertOutcome, JobStore};

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    keys: HashMap<String, JobId>,
    results: HashMap<JobId, ProcessingResult>,
}

impl MemoryState {
    fn check(&self, job: &Job, expected_state: JobState) -> StoreResult<()> {
        let stored = self
            .jobs
            .get(&job.id)
            .ok_or_else(|| StoreError::not_found(job.id.as_str()))?;

        if stored.state != expected_state || stored.version != job.version {
            return Err(StoreError::Conflict {
                job_id: job.id.to_string(),
                expected: expected_state,
                expected_version: job.version,
                actual: stored.state,
                actual_version: stored.version,
            });
        }
        Ok(())
    }

    fn write(&mut self, job: &Job) -> Job {
        let mut written = job.clone();
        written.version = job.version + 1;
        written.updated_at = Utc::now();

        if !written.state.holds_idempotency_key()
            && self.keys.get(&written.idempotency_key) == Some(&written.id)
        {
            self.keys.remove(&written.idempotency_key);
        }

        self.jobs.insert(written.id.clone(), written.clone());
        written
    }
}

/// Job store held in process memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: RwLock<MemoryState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_or_get(&self, job: Job) -> StoreResult<InsertOutcome> {
        let mut state = self.state.write().await;

        if let Some(existing_id) = state.keys.get(&job.idempotency_key) {
            if let Some(existing) = state.jobs.get(existing_id) {
                if existing.state.holds_idempotency_key() {
                    return Ok(InsertOutcome::Existing(existing.clone()));
                }
            }
        }

        let written = state.write(&job);
        state
            .keys
            .insert(written.idempotency_key.clone(), written.id.clone());
        debug!(job_id = %written.id, key = %written.idempotency_key, "Job inserted");
        Ok(InsertOutcome::Created(written))
    }

    async fn get(&self, job_id: &JobId) -> StoreResult<Option<Job>> {
        Ok(self.state.read().await.jobs.get(job_id).cloned())
    }

    async fn find_by_idempotency_key(&self, key: &str) -> StoreResult<Option<Job>> {
        let state = self.state.read().await;
        Ok(state
            .keys
            .get(key)
            .and_then(|id| state.jobs.get(id))
            .cloned())
    }

    async fn list_by_state(&self, job_state: JobState) -> StoreResult<Vec<Job>> {
        let state = self.state.read().await;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.state == job_state)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }

    async fn compare_and_set(&self, job: &Job, expected_state: JobState) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        state.check(job, expected_state)?;
        Ok(state.write(job))
    }

    async fn publish_result(&self, job: &Job, result: ProcessingResult) -> StoreResult<Job> {
        let mut state = self.state.write().await;
        state.check(job, JobState::Processing)?;
        if state.results.contains_key(&job.id) {
            return Err(StoreError::ResultExists(job.id.to_string()));
        }

        let written = state.write(job);
        state.results.insert(job.id.clone(), result);
        Ok(written)
    }

    async fn get_result(&self, job_id: &JobId) -> StoreResult<Option<ProcessingResult>> {
        Ok(self.state.read().await.results.get(job_id).cloned())
    }
}
