//! Worker configuration.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use apipe_engine::DEFAULT_CACHE_MAX_BYTES;
use apipe_models::DEFAULT_MAX_ATTEMPTS;
use apipe_queue::QueueConfig;
use uuid::Uuid;

use crate::error::{WorkerError, WorkerResult};

/// Deployment profile, from `PIPELINE_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Profile {
    #[default]
    Development,
    /// In-memory broker and store
    Testing,
    Production,
}

impl Profile {
    pub fn from_env() -> Self {
        std::env::var("PIPELINE_ENV")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Development => "development",
            Profile::Testing => "testing",
            Profile::Production => "production",
        }
    }

    pub fn uses_in_memory_backends(&self) -> bool {
        matches!(self, Profile::Testing)
    }
}

impl FromStr for Profile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "development" | "dev" => Ok(Profile::Development),
            "testing" | "test" => Ok(Profile::Testing),
            "production" | "prod" => Ok(Profile::Production),
            other => Err(format!("unknown profile: {}", other)),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub profile: Profile,
    /// Prefix for executor ids in leases and logs
    pub worker_name: String,
    /// Number of executors in the pool
    pub concurrency: usize,
    /// How long an idle executor blocks waiting for work
    pub lease_wait: Duration,
    /// Upper bound on one attempt: payload fetch, engine and export upload
    pub job_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// Attempts allowed per job before dead-lettering
    pub max_attempts: u32,
    /// First retry delay; doubles per failed attempt
    pub retry_base_delay: Duration,
    /// Cap on the retry delay
    pub retry_max_delay: Duration,
    /// Pause after a broker error before leasing again
    pub error_backoff: Duration,
    /// Budget for the engine output cache, 0 disables it
    pub engine_cache_bytes: usize,
    /// Prometheus listener, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
    /// JSON log lines instead of ANSI text
    pub log_json: bool,
    /// Broker and store connection settings
    pub queue: QueueConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Development,
            worker_name: format!("worker-{}", Uuid::new_v4()),
            concurrency: 2,
            lease_wait: Duration::from_secs(5),
            job_timeout: Duration::from_secs(300), // 5 minutes
            shutdown_timeout: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(1000),
            retry_max_delay: Duration::from_millis(300_000), // 5 minutes
            error_backoff: Duration::from_secs(5),
            engine_cache_bytes: DEFAULT_CACHE_MAX_BYTES,
            metrics_addr: None,
            log_json: false,
            queue: QueueConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let profile = Profile::from_env();

        Self {
            profile,
            worker_name: std::env::var("WORKER_NAME").unwrap_or(defaults.worker_name),
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.concurrency),
            lease_wait: std::env::var("WORKER_LEASE_WAIT_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.lease_wait),
            job_timeout: std::env::var("WORKER_JOB_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_timeout),
            shutdown_timeout: std::env::var("WORKER_SHUTDOWN_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_timeout),
            max_attempts: std::env::var("JOB_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            retry_base_delay: std::env::var("RETRY_BASE_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: std::env::var("RETRY_MAX_DELAY_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_max_delay),
            error_backoff: defaults.error_backoff,
            engine_cache_bytes: std::env::var("ENGINE_CACHE_BYTES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.engine_cache_bytes),
            metrics_addr: std::env::var("METRICS_ADDR")
                .ok()
                .and_then(|s| s.parse().ok()),
            log_json: std::env::var("LOG_FORMAT")
                .map(|v| v.to_lowercase() == "json")
                .unwrap_or(profile == Profile::Production),
            queue: QueueConfig::from_env(),
        }
    }

    /// Visibility timeout applied to every lease.
    pub fn visibility_timeout(&self) -> Duration {
        self.queue.visibility_timeout
    }

    /// Reject settings the pool cannot run safely with.
    ///
    /// The visibility timeout must outlast the engine timeout, otherwise a
    /// healthy job is redelivered while still running.
    pub fn validate(&self) -> WorkerResult<()> {
        if self.concurrency == 0 {
            return Err(WorkerError::config("WORKER_CONCURRENCY must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(WorkerError::config("JOB_MAX_ATTEMPTS must be at least 1"));
        }
        if self.visibility_timeout() <= self.job_timeout {
            return Err(WorkerError::config(format!(
                "visibility timeout ({:?}) must exceed job timeout ({:?})",
                self.visibility_timeout(),
                self.job_timeout
            )));
        }
        if self.retry_max_delay < self.retry_base_delay {
            return Err(WorkerError::config(
                "RETRY_MAX_DELAY_MS must not be below RETRY_BASE_DELAY_MS",
            ));
        }
        Ok(())
    }

    /// Executor id for slot `index`.
    pub fn executor_id(&self, index: usize) -> String {
        format!("{}-{}", self.worker_name, index)
    }
}
