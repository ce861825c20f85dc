//! Job executor.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::processor::{process_lease, ProcessingContext};
use crate::retry::FailureTracker;

/// Broker errors logged before the tracker goes quiet.
const MAX_LOGGED_LEASE_FAILURES: u32 = 3;

/// One executor: leases a job, processes it, repeats.
///
/// An executor holds at most one lease at a time and checks for shutdown
/// only between jobs, so an in-flight job always runs to its settle point.
pub struct JobExecutor {
    ctx: Arc<ProcessingContext>,
    worker_id: String,
    shutdown: watch::Receiver<bool>,
}

impl JobExecutor {
    pub fn new(ctx: Arc<ProcessingContext>, worker_id: String, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            worker_id,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until shutdown is signalled.
    pub async fn run(mut self) {
        info!(worker_id = %self.worker_id, "Executor started");

        let visibility_timeout = self.ctx.config.visibility_timeout();
        let lease_wait = self.ctx.config.lease_wait;
        let mut failures = FailureTracker::new(MAX_LOGGED_LEASE_FAILURES);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let broker = self.ctx.dispatcher.broker();
            let leased = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                leased = broker.lease(&self.worker_id, visibility_timeout, Some(lease_wait)) => leased,
            };

            match leased {
                Ok(Some(lease)) => {
                    failures.record_success();
                    let job_id = lease.job_id.clone();
                    let outcome = process_lease(&self.ctx, lease).await;
                    debug!(worker_id = %self.worker_id, job_id = %job_id, ?outcome, "Lease settled");
                }
                Ok(None) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        warn!(worker_id = %self.worker_id, "Failed to lease job: {}", e);
                    }
                    tokio::select! {
                        _ = self.shutdown.changed() => {}
                        _ = tokio::time::sleep(self.ctx.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker_id = %self.worker_id, "Executor stopped");
    }
}
