//! Job record and state machine.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::error::{JobError, TransitionError};
use crate::operation::OperationSpec;

/// Default number of processing attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pointer to audio held by payload storage. Never the bytes themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct PayloadRef(pub String);

impl PayloadRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn key(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatch priority. Higher tiers are served first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

impl Priority {
    /// Tiers from highest to lowest, in dispatch order.
    pub const DISPATCH_ORDER: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the broker for a worker
    #[default]
    Queued,
    /// Claimed by a worker, not started yet
    Leased,
    /// Engine invocation in progress
    Processing,
    /// Result published
    Succeeded,
    /// Attempt failed, awaiting the retry decision
    Failed,
    /// Retries exhausted or failure not retryable
    DeadLettered,
    /// Cancelled before a result was published
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Queued,
        JobState::Leased,
        JobState::Processing,
        JobState::Succeeded,
        JobState::Failed,
        JobState::DeadLettered,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Leased => "leased",
            JobState::Processing => "processing",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::DeadLettered => "dead_lettered",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::DeadLettered | JobState::Cancelled
        )
    }

    /// Whether a job in this state still owns its idempotency key.
    pub fn holds_idempotency_key(&self) -> bool {
        !matches!(self, JobState::DeadLettered | JobState::Cancelled)
    }

    /// Edges of the state machine.
    ///
    /// `Processing -> Cancelled` is additionally gated on a recorded
    /// cancellation request, see [`Job::cancel`].
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Leased)
                | (Queued, Cancelled)
                | (Leased, Processing)
                | (Leased, Cancelled)
                | (Processing, Succeeded)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Failed, Queued)
                | (Failed, DeadLettered)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Derive an idempotency key from payload and operation.
///
/// Format: `auto:{sha256(payload key || canonical op json)}`
pub fn derive_idempotency_key(payload: &PayloadRef, operation: &OperationSpec) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.key().as_bytes());
    hasher.update([0u8]);
    hasher.update(operation.canonical_json().as_bytes());
    format!("auto:{:x}", hasher.finalize())
}

/// One unit of audio-processing work and its tracked lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Source audio location
    pub payload: PayloadRef,

    /// Transform to apply
    pub operation: OperationSpec,

    /// Dispatch priority
    #[serde(default)]
    pub priority: Priority,

    /// Current state
    #[serde(default)]
    pub state: JobState,

    /// Failed attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Attempts allowed before dead-lettering
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Caller-supplied or derived deduplication key
    pub idempotency_key: String,

    /// Processed audio location (set once Succeeded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<PayloadRef>,

    /// Most recent failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<JobError>,

    /// Cancellation recorded while the job could not be cancelled directly
    #[serde(default)]
    pub cancel_requested: bool,

    /// Write counter for compare-and-set, maintained by the store
    #[serde(default)]
    pub version: u64,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl Job {
    /// Create a new Queued job.
    ///
    /// When `idempotency_key` is `None` the key is derived from payload and
    /// operation.
    pub fn new(
        payload: PayloadRef,
        operation: OperationSpec,
        idempotency_key: Option<String>,
        priority: Priority,
    ) -> Self {
        let idempotency_key =
            idempotency_key.unwrap_or_else(|| derive_idempotency_key(&payload, &operation));
        let now = Utc::now();

        Self {
            id: JobId::new(),
            payload,
            operation,
            priority,
            state: JobState::Queued,
            attempts: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            idempotency_key,
            result_ref: None,
            last_error: None,
            cancel_requested: false,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set maximum attempts (at least one).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Number of the attempt currently running or about to run (1-based).
    pub fn current_attempt(&self) -> u32 {
        self.attempts + 1
    }

    /// Whether the current failure is the last one allowed.
    pub fn attempts_exhausted(&self) -> bool {
        self.current_attempt() >= self.max_attempts
    }

    /// Validate and apply a state change.
    pub fn transition(&mut self, next: JobState) -> Result<(), TransitionError> {
        let gated = self.state == JobState::Processing
            && next == JobState::Cancelled
            && !self.cancel_requested;
        if gated || !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Queued -> Leased.
    pub fn lease(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Leased)
    }

    /// Re-take a job still marked Leased by a holder whose lease expired.
    ///
    /// The state does not change; the store's version bump fences the
    /// previous holder out.
    pub fn retake_lease(&mut self) -> Result<(), TransitionError> {
        if self.state != JobState::Leased {
            return Err(TransitionError {
                from: self.state,
                to: JobState::Leased,
            });
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Leased -> Processing.
    pub fn start_processing(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Processing)
    }

    /// Processing -> Succeeded.
    pub fn succeed(&mut self, result_ref: Option<PayloadRef>) -> Result<(), TransitionError> {
        self.transition(JobState::Succeeded)?;
        self.result_ref = result_ref;
        self.last_error = None;
        Ok(())
    }

    /// Processing -> Failed, recording the error.
    pub fn fail(&mut self, error: JobError) -> Result<(), TransitionError> {
        self.transition(JobState::Failed)?;
        self.last_error = Some(error);
        Ok(())
    }

    /// Failed -> Queued. Counts the failed attempt.
    pub fn requeue(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Queued)?;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        Ok(())
    }

    /// Failed -> DeadLettered. Counts the failed attempt and keeps the error.
    pub fn dead_letter(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::DeadLettered)?;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        Ok(())
    }

    /// Move to Cancelled.
    ///
    /// Allowed from Queued or Leased, and from Processing only when a
    /// cancellation was recorded with [`Job::request_cancel`].
    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.transition(JobState::Cancelled)
    }

    /// Record a cancellation to be honored at the next checkpoint.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = Utc::now();
    }
}
