//! In-process broker.

use std::collections::HashMap;
use std::time::Duration;

use apipe_models::{JobId, Priority};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use crate::broker::{Lease, LeaseToken, QueueBroker, QueueDepth};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
struct Pending {
    priority: Priority,
    seq: u64,
    visible_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Clone)]
struct Held {
    job_id: JobId,
    priority: Priority,
    seq: u64,
    delivery_count: u32,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct State {
    pending: HashMap<JobId, Pending>,
    leases: HashMap<LeaseToken, Held>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Return expired leases to the pending set.
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<LeaseToken> = self
            .leases
            .iter()
            .filter(|(_, held)| held.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(held) = self.leases.remove(&token) {
                debug!(job_id = %held.job_id, "Lease expired, job visible again");
                self.pending.insert(
                    held.job_id,
                    Pending {
                        priority: held.priority,
                        seq: held.seq,
                        visible_at: now,
                        delivery_count: held.delivery_count,
                    },
                );
            }
        }
    }

    /// Highest tier first, then oldest enqueue.
    fn next_visible(&self, now: Instant) -> Option<JobId> {
        self.pending
            .iter()
            .filter(|(_, p)| p.visible_at <= now)
            .min_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)))
            .map(|(id, _)| id.clone())
    }

    /// Earliest instant at which something may become leasable.
    fn next_wakeup(&self) -> Option<Instant> {
        let pending = self.pending.values().map(|p| p.visible_at);
        let leases = self.leases.values().map(|h| h.expires_at);
        pending.chain(leases).min()
    }

    fn holds(&self, job_id: &JobId) -> bool {
        self.pending.contains_key(job_id) || self.leases.values().any(|h| &h.job_id == job_id)
    }

    /// Remove a live lease. Expired leases are reclaimed and reported missing.
    fn take_lease(&mut self, token: &LeaseToken, now: Instant) -> QueueResult<Held> {
        self.reclaim_expired(now);
        self.leases
            .remove(token)
            .ok_or_else(|| QueueError::lease_not_found(token.as_str()))
    }
}

/// Broker held in process memory.
///
/// Uses tokio's clock, so tests may drive visibility timeouts and nack delays
/// with paused time.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    state: Mutex<State>,
    notify: Notify,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_lease(&self, state: &mut State, worker_id: &str, visibility_timeout: Duration) -> Option<Lease> {
        let now = Instant::now();
        state.reclaim_expired(now);

        let job_id = state.next_visible(now)?;
        let pending = state.pending.remove(&job_id)?;
        let token = LeaseToken::new();
        let delivery_count = pending.delivery_count + 1;

        state.leases.insert(
            token.clone(),
            Held {
                job_id: job_id.clone(),
                priority: pending.priority,
                seq: pending.seq,
                delivery_count,
                expires_at: now + visibility_timeout,
            },
        );

        let leased_at = Utc::now();
        let expires_at = leased_at
            + chrono::Duration::from_std(visibility_timeout).unwrap_or_else(|_| chrono::Duration::days(365));

        Some(Lease {
            job_id,
            token,
            worker_id: worker_id.to_string(),
            priority: pending.priority,
            delivery_count,
            leased_at,
            expires_at,
        })
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    async fn enqueue(&self, job_id: &JobId, priority: Priority) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        if state.holds(job_id) {
            debug!(job_id = %job_id, "Job already held by broker, enqueue ignored");
            return Ok(());
        }

        let seq = state.next_seq();
        state.pending.insert(
            job_id.clone(),
            Pending {
                priority,
                seq,
                visible_at: Instant::now(),
                delivery_count: 0,
            },
        );
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn lease(
        &self,
        worker_id: &str,
        visibility_timeout: Duration,
        wait: Option<Duration>,
    ) -> QueueResult<Option<Lease>> {
        let deadline = wait.map(|w| Instant::now() + w);

        loop {
            let mut state = self.state.lock().await;
            if let Some(lease) = self.try_lease(&mut state, worker_id, visibility_timeout) {
                return Ok(Some(lease));
            }

            let deadline = match deadline {
                Some(d) if Instant::now() < d => d,
                _ => return Ok(None),
            };
            let wake_at = state.next_wakeup().map_or(deadline, |t| t.min(deadline));

            // Register before releasing the lock so an enqueue in between is seen
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(state);

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, token: &LeaseToken) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        let held = state.take_lease(token, Instant::now())?;
        debug!(job_id = %held.job_id, "Acked");
        Ok(())
    }

    async fn nack(&self, token: &LeaseToken, delay: Duration) -> QueueResult<()> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let held = state.take_lease(token, now)?;
        let seq = state.next_seq();

        debug!(job_id = %held.job_id, delay_ms = delay.as_millis() as u64, "Nacked");
        state.pending.insert(
            held.job_id,
            Pending {
                priority: held.priority,
                seq,
                visible_at: now + delay,
                delivery_count: held.delivery_count,
            },
        );
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn contains(&self, job_id: &JobId) -> QueueResult<bool> {
        Ok(self.state.lock().await.holds(job_id))
    }

    async fn depth(&self) -> QueueResult<QueueDepth> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let mut depth = QueueDepth::default();
        for pending in state.pending.values() {
            let tier = depth.tier_mut(pending.priority);
            if pending.visible_at <= now {
                tier.ready += 1;
            } else {
                tier.delayed += 1;
            }
        }
        for held in state.leases.values() {
            depth.tier_mut(held.priority).leased += 1;
        }
        Ok(depth)
    }
}
