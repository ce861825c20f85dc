//! Broker contract.

use std::fmt;
use std::time::Duration;

use apipe_models::{JobId, Priority};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QueueResult;

/// Proof of holding a lease. Required to ack or nack.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(pub String);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Temporary exclusive claim on a job reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub token: LeaseToken,
    pub worker_id: String,
    pub priority: Priority,
    /// Times this reference has been handed out, including this one
    pub delivery_count: u32,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Whether an earlier holder lost this reference to a visibility timeout
    /// or a nack.
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Counts for one priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierDepth {
    /// Visible and waiting
    pub ready: usize,
    /// Waiting for a nack delay to elapse
    pub delayed: usize,
    /// Currently held by a worker
    pub leased: usize,
}

impl TierDepth {
    pub fn total(&self) -> usize {
        self.ready + self.delayed + self.leased
    }
}

/// Snapshot of the broker's contents per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub high: TierDepth,
    pub normal: TierDepth,
    pub low: TierDepth,
}

impl QueueDepth {
    pub fn tier(&self, priority: Priority) -> &TierDepth {
        match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    pub fn tier_mut(&mut self, priority: Priority) -> &mut TierDepth {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn ready(&self) -> usize {
        self.high.ready + self.normal.ready + self.low.ready
    }

    pub fn total(&self) -> usize {
        self.high.total() + self.normal.total() + self.low.total()
    }
}

/// Durable, at-least-once delivery of job references.
///
/// Higher tiers are served before lower ones whenever they have visible
/// work; within a tier references come out in enqueue order (redelivered
/// references may jump ahead). A lease that is neither acked nor nacked
/// before its visibility timeout makes the reference visible again.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Make a job reference available. No-op if the broker already holds it.
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<()>;

    /// Claim the next visible reference.
    ///
    /// `wait = None` polls once; `Some(d)` blocks up to `d` for work.
    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
        wait: Option<Duration>,
    ) -> QueueResult<Option<Lease>>;

    /// Remove the reference permanently.
    async fn ack(&self, token: &LeaseToken) -> QueueResult<()>;

    /// Release the lease; the reference becomes visible after `delay`.
    async fn nack(&self, token: &LeaseToken, delay: Duration) -> QueueResult<()>;

    /// Whether the reference is held in any form (ready, delayed or leased).
    async fn contains(&self, job_id: &JobId) -> QueueResult<bool>;

    async fn depth(&self) -> QueueResult<QueueDepth>;
}
