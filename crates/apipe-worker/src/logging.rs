//! Structured job logging.
//!
//! Every line carries the job id, operation kind, executor id and attempt,
//! so one job's history can be pulled out of interleaved executor output.

use apipe_models::Job;
use tracing::{error, info, warn, Span};

/// Job logger for structured logging with consistent fields.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    op: &'static str,
    worker_id: String,
    attempt: u32,
}

impl JobLogger {
    pub fn new(job: &Job, worker_id: &str) -> Self {
        Self {
            job_id: job.id.to_string(),
            op: job.operation.kind(),
            worker_id: worker_id.to_string(),
            attempt: job.current_attempt(),
        }
    }

    /// Log the start of an attempt.
    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job started: {}", message
        );
    }

    /// Log a progress update during job execution.
    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job error: {}", message
        );
    }

    /// Log the end of the job's processing on this executor.
    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Span wrapping one attempt; engine and storage logs nest inside it.
    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            op = self.op,
            worker_id = %self.worker_id,
            attempt = self.attempt
        )
    }
}
