//! Audio job worker.
//!
//! This crate provides:
//! - The dispatcher: submission with dedup, cancellation, retry decisions
//! - The worker pool: executors that lease, process and settle jobs
//! - Backoff policy, structured job logging and Prometheus metrics
//! - Graceful shutdown

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod retry;

pub use config::{Profile, WorkerConfig};
pub use dispatcher::{Dispatcher, FailureDecision, JobStatus, SubmitRequest, Submission};
pub use error::{WorkerError, WorkerResult};
pub use executor::JobExecutor;
pub use logging::JobLogger;
pub use pool::WorkerPool;
pub use processor::{process_lease, LeaseOutcome, ProcessingContext};
pub use retry::{BackoffPolicy, FailureTracker};
