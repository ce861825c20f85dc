//! Shared data models for the audio job pipeline.
//!
//! This crate provides Serde-serializable types for:
//! - Job records and the job state machine
//! - Operation specs (the closed set of supported audio transforms)
//! - Processing results and derived metrics
//! - Job lifecycle events for the notify path

pub mod error;
pub mod event;
pub mod job;
pub mod operation;
pub mod result;

// Re-export common types
pub use error::{ErrorKind, JobError, TransitionError};
pub use event::JobEvent;
pub use job::{derive_idempotency_key, Job, JobId, JobState, PayloadRef, Priority, DEFAULT_MAX_ATTEMPTS};
pub use operation::{AudioFormat, Feature, OperationSpec, OperationSpecError};
pub use result::{MetricValue, Metrics, ProcessingResult};
