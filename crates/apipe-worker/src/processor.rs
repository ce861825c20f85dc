//! Processing of one leased job.
//!
//! Flow per lease: reconcile the stored record with the delivery, move the
//! job to Processing, fetch the payload, run the engine, check for a
//! recorded cancel, write the processed audio under a key owned by this
//! attempt, then publish the result and Succeeded in one store write before
//! acking. Everything up to the upload runs under the job timeout.
//! Failures are classified once and handed to the dispatcher.

use std::sync::Arc;
use std::time::Instant;

use apipe_engine::{AudioEngine, AudioInput, EngineOutput};
use apipe_models::{ErrorKind, Job, JobError, JobState, PayloadRef, ProcessingResult};
use apipe_queue::Lease;
use apipe_storage::{export_key, PayloadStore};
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::dispatcher::{Dispatcher, FailureDecision};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::metrics;

/// Everything an executor needs to process a lease.
pub struct ProcessingContext {
    pub config: WorkerConfig,
    pub dispatcher: Arc<Dispatcher>,
    pub payloads: Arc<dyn PayloadStore>,
    pub engine: Arc<dyn AudioEngine>,
}

impl ProcessingContext {
    pub fn new(
        config: WorkerConfig,
        dispatcher: Arc<Dispatcher>,
        payloads: Arc<dyn PayloadStore>,
        engine: Arc<dyn AudioEngine>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            payloads,
            engine,
        }
    }
}

/// How a lease was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOutcome {
    Succeeded,
    Cancelled,
    Retried { delay: std::time::Duration },
    DeadLettered,
    /// The reference pointed at a finished or missing job and was acked
    Discarded,
    /// Left for the visibility timeout to reclaim
    Abandoned,
}

impl From<FailureDecision> for LeaseOutcome {
    fn from(decision: FailureDecision) -> Self {
        match decision {
            FailureDecision::Retried { delay } => LeaseOutcome::Retried { delay },
            FailureDecision::DeadLettered => LeaseOutcome::DeadLettered,
            FailureDecision::Cancelled => LeaseOutcome::Cancelled,
        }
    }
}

/// Process one lease to a settled outcome. Never fails: whatever cannot be
/// settled is left for the broker's visibility timeout.
pub async fn process_lease(ctx: &ProcessingContext, lease: Lease) -> LeaseOutcome {
    match run_lease(ctx, &lease).await {
        Ok(outcome) => outcome,
        Err(e) if e.is_conflict() => settle_conflict(ctx, &lease, &e).await,
        Err(e) if e.kind() == ErrorKind::ConsistencyViolation => {
            metrics::record_consistency_violation();
            error!(
                job_id = %lease.job_id,
                worker_id = %lease.worker_id,
                "Consistency violation, leaving lease to expire: {}", e
            );
            LeaseOutcome::Abandoned
        }
        Err(e) => {
            warn!(
                job_id = %lease.job_id,
                worker_id = %lease.worker_id,
                "Could not settle job, leaving lease to expire: {}", e
            );
            LeaseOutcome::Abandoned
        }
    }
}

async fn run_lease(ctx: &ProcessingContext, lease: &Lease) -> WorkerResult<LeaseOutcome> {
    let dispatcher = &ctx.dispatcher;

    let Some(mut job) = dispatcher.store().get(&lease.job_id).await? else {
        warn!(job_id = %lease.job_id, "Leased job has no record, dropping reference");
        dispatcher.ack(&lease.token, &lease.job_id).await;
        return Ok(LeaseOutcome::Discarded);
    };

    match job.state {
        JobState::Succeeded | JobState::DeadLettered | JobState::Cancelled => {
            debug!(job_id = %job.id, state = %job.state, "Job already finished, acking");
            dispatcher.ack(&lease.token, &job.id).await;
            return Ok(LeaseOutcome::Discarded);
        }
        JobState::Queued => {
            job.lease()?;
            job = dispatcher.persist(&job, JobState::Queued).await?;
        }
        JobState::Leased => {
            // Previous holder died before starting; the version bump fences it
            job.retake_lease()?;
            job = dispatcher.persist(&job, JobState::Leased).await?;
            info!(
                job_id = %job.id,
                worker_id = %lease.worker_id,
                delivery = lease.delivery_count,
                "Re-took lease from previous holder"
            );
        }
        JobState::Processing => {
            // Previous holder lost its attempt to the visibility timeout
            job.fail(JobError::new(
                ErrorKind::LeaseExpired,
                format!("attempt {} lost to visibility timeout", job.current_attempt()),
            ))?;
            let failed = dispatcher.persist(&job, JobState::Processing).await?;
            metrics::record_failed(ErrorKind::LeaseExpired);
            warn!(job_id = %failed.id, attempt = failed.current_attempt(), "Reclaimed job from expired lease");
            return Ok(dispatcher.handle_failure(failed, lease).await?.into());
        }
        JobState::Failed => {
            // Previous holder recorded the failure but never decided on it
            return Ok(dispatcher.handle_failure(job, lease).await?.into());
        }
    }

    // A cancel recorded on the retry path that never completed
    if job.cancel_requested {
        job.cancel()?;
        dispatcher.persist(&job, JobState::Leased).await?;
        dispatcher.ack(&lease.token, &job.id).await;
        metrics::record_cancelled();
        return Ok(LeaseOutcome::Cancelled);
    }

    job.start_processing()?;
    let job = dispatcher.persist(&job, JobState::Leased).await?;

    let logger = JobLogger::new(&job, &lease.worker_id);
    let span = logger.create_span();
    execute(ctx, job, lease, &logger).instrument(span).await
}

/// Run one attempt of a job that is now Processing.
///
/// Fetch, engine and export upload share one deadline of `job_timeout`, so
/// an attempt cannot outlive its lease while still writing.
async fn execute(
    ctx: &ProcessingContext,
    job: Job,
    lease: &Lease,
    logger: &JobLogger,
) -> WorkerResult<LeaseOutcome> {
    let op = job.operation.kind();
    let deadline = tokio::time::Instant::now() + ctx.config.job_timeout;
    logger.log_start(&format!("{} on {}", op, job.payload));

    let bytes = match timeout_at(deadline, ctx.payloads.fetch(&job.payload)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => return fail_attempt(ctx, job, lease, e.into(), logger).await,
        Err(_) => return Ok(past_deadline(ctx, logger, "fetch")),
    };
    logger.log_progress(&format!("fetched {} bytes", bytes.len()));

    let input = AudioInput::new(job.payload.clone(), bytes);
    let started = Instant::now();
    let outcome = timeout_at(deadline, ctx.engine.process(&input, &job.operation)).await;
    metrics::record_engine_duration(op, started.elapsed().as_secs_f64());

    let output = match outcome {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return fail_attempt(ctx, job, lease, e.into(), logger).await,
        Err(_) => return Ok(past_deadline(ctx, logger, "engine")),
    };

    // Checkpoint: a cancel may have been recorded while the engine ran
    let current = ctx
        .dispatcher
        .store()
        .get(&job.id)
        .await?
        .ok_or_else(|| WorkerError::job_not_found(job.id.as_str()))?;
    if current.state == JobState::Processing && current.cancel_requested {
        logger.log_progress("cancel requested, discarding output");
        return cancel_at_checkpoint(ctx, current, lease).await;
    }
    if current.version != job.version {
        return Ok(settle_conflict(ctx, lease, &WorkerError::Contended(job.id.to_string())).await);
    }

    let EngineOutput {
        audio,
        format,
        metrics: output_metrics,
    } = output;
    let metric_count = output_metrics.len();

    let result_ref = match (audio, format) {
        (Some(bytes), Some(format)) => {
            let key = export_key(job.id.as_str(), job.version, format.extension());
            let put = ctx.payloads.put(&key, bytes, format.content_type());
            match timeout_at(deadline, put).await {
                Ok(Ok(r)) => Some(r),
                Ok(Err(e)) => return fail_attempt(ctx, job, lease, e.into(), logger).await,
                Err(_) => {
                    discard_export(ctx, &PayloadRef::new(key)).await;
                    return Ok(past_deadline(ctx, logger, "export upload"));
                }
            }
        }
        _ => None,
    };

    let result = ProcessingResult::new(
        job.id.clone(),
        result_ref.clone(),
        output_metrics,
        ctx.engine.version(),
    );
    let mut done = job.clone();
    done.succeed(result_ref.clone())?;

    match ctx.dispatcher.complete(&done, result).await {
        Ok(_) => {}
        Err(e) if e.is_conflict() => {
            if let Some(r) = &result_ref {
                discard_export(ctx, r).await;
            }
            return Ok(settle_conflict(ctx, lease, &e).await);
        }
        Err(e) => return Err(e),
    }

    ctx.dispatcher.ack(&lease.token, &job.id).await;
    metrics::record_succeeded(op);
    logger.log_completion(&format!(
        "{} metrics, output {}",
        metric_count,
        result_ref.as_ref().map_or("none", |r| r.key())
    ));
    Ok(LeaseOutcome::Succeeded)
}

fn past_deadline(ctx: &ProcessingContext, logger: &JobLogger, stage: &str) -> LeaseOutcome {
    logger.log_error(&format!(
        "attempt exceeded {:?} during {}, leaving lease to expire",
        ctx.config.job_timeout, stage
    ));
    LeaseOutcome::Abandoned
}

/// Record a failed attempt and let the dispatcher decide what follows.
async fn fail_attempt(
    ctx: &ProcessingContext,
    mut job: Job,
    lease: &Lease,
    err: WorkerError,
    logger: &JobLogger,
) -> WorkerResult<LeaseOutcome> {
    let kind = err.kind();
    if kind == ErrorKind::ConsistencyViolation {
        return Err(err);
    }

    logger.log_error(&format!("{}: {}", kind, err));
    metrics::record_failed(kind);

    job.fail(JobError::new(kind, err.to_string()))?;
    let failed = ctx.dispatcher.persist(&job, JobState::Processing).await?;
    Ok(ctx.dispatcher.handle_failure(failed, lease).await?.into())
}

/// Honor a cancel recorded during Processing.
async fn cancel_at_checkpoint(
    ctx: &ProcessingContext,
    mut job: Job,
    lease: &Lease,
) -> WorkerResult<LeaseOutcome> {
    job.cancel()?;
    ctx.dispatcher.persist(&job, JobState::Processing).await?;
    ctx.dispatcher.ack(&lease.token, &job.id).await;
    metrics::record_cancelled();
    info!(job_id = %job.id, "Job cancelled at checkpoint");
    Ok(LeaseOutcome::Cancelled)
}

/// Reload after losing a compare-and-set and settle what can be settled.
async fn settle_conflict(ctx: &ProcessingContext, lease: &Lease, err: &WorkerError) -> LeaseOutcome {
    let current = match ctx.dispatcher.store().get(&lease.job_id).await {
        Ok(current) => current,
        Err(e) => {
            warn!(job_id = %lease.job_id, "Could not reload job after conflict: {}", e);
            return LeaseOutcome::Abandoned;
        }
    };

    match current {
        Some(job) if job.is_terminal() => {
            debug!(job_id = %job.id, state = %job.state, "Job finished elsewhere, acking");
            ctx.dispatcher.ack(&lease.token, &job.id).await;
            LeaseOutcome::Discarded
        }
        Some(job) if job.state == JobState::Processing && job.cancel_requested => {
            match cancel_at_checkpoint(ctx, job, lease).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(job_id = %lease.job_id, "Could not cancel job: {}", e);
                    LeaseOutcome::Abandoned
                }
            }
        }
        Some(job) if job.state == JobState::Failed => {
            // The failure was recorded; only the decision on it was lost
            match ctx.dispatcher.handle_failure(job, lease).await {
                Ok(decision) => decision.into(),
                Err(e) => {
                    warn!(job_id = %lease.job_id, "Could not settle failed job: {}", e);
                    LeaseOutcome::Abandoned
                }
            }
        }
        _ => {
            metrics::record_consistency_violation();
            error!(
                job_id = %lease.job_id,
                worker_id = %lease.worker_id,
                "Job changed under this lease: {}", err
            );
            LeaseOutcome::Abandoned
        }
    }
}

async fn discard_export(ctx: &ProcessingContext, payload: &PayloadRef) {
    if let Err(e) = ctx.payloads.delete(payload).await {
        warn!(key = %payload, "Failed to discard processed audio: {}", e);
    }
}
