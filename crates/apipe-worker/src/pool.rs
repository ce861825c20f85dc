//! Fixed-size pool of executors with panic supervision and graceful
//! shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{error, info, warn};

use crate::error::WorkerResult;
use crate::executor::JobExecutor;
use crate::metrics;
use crate::processor::ProcessingContext;

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs `config.concurrency` executors until shutdown.
pub struct WorkerPool {
    ctx: Arc<ProcessingContext>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn new(ctx: Arc<ProcessingContext>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self { ctx, shutdown }
    }

    pub fn context(&self) -> &Arc<ProcessingContext> {
        &self.ctx
    }

    /// Signal shutdown. Executors stop leasing and finish in-flight jobs.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run the pool until [`WorkerPool::shutdown`] is called.
    ///
    /// In-flight jobs get `shutdown_timeout` to finish; executors still
    /// running after that are aborted and their leases left to expire.
    pub async fn run(&self) -> WorkerResult<()> {
        let concurrency = self.ctx.config.concurrency;
        info!(concurrency, worker = %self.ctx.config.worker_name, "Starting worker pool");

        let mut slots = JoinSet::new();
        for index in 0..concurrency {
            slots.spawn(supervise(
                Arc::clone(&self.ctx),
                self.ctx.config.executor_id(index),
                self.shutdown.subscribe(),
            ));
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                joined = slots.join_next() => {
                    if joined.is_none() {
                        info!("All executors exited");
                        return Ok(());
                    }
                }
            }
        }

        info!("Shutdown signal received, waiting for in-flight jobs to complete...");
        let drain = async { while slots.join_next().await.is_some() {} };
        if tokio::time::timeout(self.ctx.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                "In-flight jobs still running after {:?}, aborting",
                self.ctx.config.shutdown_timeout
            );
            slots.abort_all();
        }

        info!("Worker pool stopped");
        Ok(())
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Keep one executor slot filled, restarting the executor if it panics.
async fn supervise(ctx: Arc<ProcessingContext>, worker_id: String, shutdown: watch::Receiver<bool>) {
    loop {
        let executor = JobExecutor::new(Arc::clone(&ctx), worker_id.clone(), shutdown.clone());
        let handle = tokio::spawn(executor.run());
        let _guard = AbortOnDrop(handle.abort_handle());

        match handle.await {
            Ok(()) => return,
            Err(e) if e.is_panic() && !*shutdown.borrow() => {
                // The panicked job's lease is reclaimed by its visibility timeout
                error!(worker_id = %worker_id, "Executor panicked, restarting");
                metrics::record_executor_restart();
            }
            Err(e) => {
                warn!(worker_id = %worker_id, "Executor ended abnormally: {}", e);
                return;
            }
        }
    }
}
