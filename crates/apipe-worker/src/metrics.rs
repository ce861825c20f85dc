//! Prometheus metrics for the pipeline.

use std::net::SocketAddr;

use apipe_models::ErrorKind;
use apipe_queue::QueueDepth;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Metric names as constants for consistency.
pub mod names {
    // Submission
    pub const JOBS_SUBMITTED_TOTAL: &str = "apipe_jobs_submitted_total";
    pub const JOBS_DEDUPLICATED_TOTAL: &str = "apipe_jobs_deduplicated_total";

    // Outcomes
    pub const JOBS_SUCCEEDED_TOTAL: &str = "apipe_jobs_succeeded_total";
    pub const JOBS_FAILED_TOTAL: &str = "apipe_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "apipe_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "apipe_jobs_dead_lettered_total";
    pub const JOBS_CANCELLED_TOTAL: &str = "apipe_jobs_cancelled_total";
    pub const CONSISTENCY_VIOLATIONS_TOTAL: &str = "apipe_consistency_violations_total";

    // Engine
    pub const ENGINE_DURATION_SECONDS: &str = "apipe_engine_duration_seconds";
    pub const ENGINE_CACHE_HITS_TOTAL: &str = apipe_engine::CACHE_HITS_METRIC;

    // Pool and broker
    pub const EXECUTOR_RESTARTS_TOTAL: &str = "apipe_executor_restarts_total";
    pub const QUEUE_READY: &str = "apipe_queue_ready";
    pub const QUEUE_DELAYED: &str = "apipe_queue_delayed";
    pub const QUEUE_LEASED: &str = "apipe_queue_leased";
}

/// Install the Prometheus recorder with an HTTP listener on `addr`.
///
/// Must be called from within a tokio runtime.
pub fn install_prometheus(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()
}

pub fn record_submitted(op: &str) {
    let labels = [("op", op.to_string())];
    counter!(names::JOBS_SUBMITTED_TOTAL, &labels).increment(1);
}

pub fn record_deduplicated(op: &str) {
    let labels = [("op", op.to_string())];
    counter!(names::JOBS_DEDUPLICATED_TOTAL, &labels).increment(1);
}

pub fn record_succeeded(op: &str) {
    let labels = [("op", op.to_string())];
    counter!(names::JOBS_SUCCEEDED_TOTAL, &labels).increment(1);
}

/// Record one failed attempt.
pub fn record_failed(kind: ErrorKind) {
    let labels = [("kind", kind.as_str().to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_retried(op: &str) {
    let labels = [("op", op.to_string())];
    counter!(names::JOBS_RETRIED_TOTAL, &labels).increment(1);
}

pub fn record_dead_lettered(kind: ErrorKind) {
    let labels = [("kind", kind.as_str().to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

pub fn record_cancelled() {
    counter!(names::JOBS_CANCELLED_TOTAL).increment(1);
}

pub fn record_consistency_violation() {
    counter!(names::CONSISTENCY_VIOLATIONS_TOTAL).increment(1);
}

/// Record engine wall time, cache hits included.
pub fn record_engine_duration(op: &str, duration_secs: f64) {
    let labels = [("op", op.to_string())];
    histogram!(names::ENGINE_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn record_executor_restart() {
    counter!(names::EXECUTOR_RESTARTS_TOTAL).increment(1);
}

/// Publish a broker depth snapshot as per-tier gauges.
pub fn set_queue_depth(depth: &QueueDepth) {
    for priority in apipe_models::Priority::DISPATCH_ORDER {
        let tier = depth.tier(priority);
        let labels = [("priority", priority.as_str().to_string())];
        gauge!(names::QUEUE_READY, &labels).set(tier.ready as f64);
        gauge!(names::QUEUE_DELAYED, &labels).set(tier.delayed as f64);
        gauge!(names::QUEUE_LEASED, &labels).set(tier.leased as f64);
    }
}
