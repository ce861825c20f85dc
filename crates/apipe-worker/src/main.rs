//! Audio job worker binary.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use apipe_engine::{AudioEngine, CachedEngine, FfmpegEngine};
use apipe_queue::{InMemoryBroker, QueueBroker, RedisBroker};
use apipe_store::{BroadcastEvents, EventSink, JobStore, MemoryJobStore, RedisEvents, RedisJobStore};
use apipe_worker::{
    BackoffPolicy, Dispatcher, ProcessingContext, WorkerConfig, WorkerPool, WorkerResult,
};

/// How often queue depth gauges are refreshed.
const DEPTH_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = WorkerConfig::from_env();
    init_tracing(config.log_json);

    info!(profile = %config.profile, "Starting apipe-worker");
    info!("Worker config: {:?}", config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if let Some(addr) = config.metrics_addr {
        match apipe_worker::metrics::install_prometheus(addr) {
            Ok(()) => info!(%addr, "Prometheus exporter listening"),
            Err(e) => warn!("Failed to install Prometheus exporter: {}", e),
        }
    }

    let ctx = match build_context(config).await {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            error!("Failed to initialize worker: {}", e);
            std::process::exit(1);
        }
    };

    match ctx.dispatcher.recover_orphans().await {
        Ok(0) => {}
        Ok(n) => info!(recovered = n, "Recovered orphaned jobs"),
        Err(e) => warn!("Orphan recovery failed: {}", e),
    }

    let pool = Arc::new(WorkerPool::new(Arc::clone(&ctx)));

    // Setup signal handler
    let signal_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received shutdown signal");
        signal_pool.shutdown();
    });

    // Refresh queue depth gauges
    if ctx.config.metrics_addr.is_some() {
        let dispatcher = Arc::clone(&ctx.dispatcher);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(DEPTH_REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = dispatcher.queue_depth().await {
                    warn!("Failed to read queue depth: {}", e);
                }
            }
        });
    }

    if let Err(e) = pool.run().await {
        error!("Worker pool error: {}", e);
        std::process::exit(1);
    }

    info!("Worker shutdown complete");
}

/// Colored text for development, JSON for production.
fn init_tracing(json: bool) {
    let env_filter = EnvFilter::from_default_env().add_directive(
        "apipe=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }
}

/// Wire backends for the configured profile.
async fn build_context(config: WorkerConfig) -> WorkerResult<ProcessingContext> {
    let (store, broker, events): (Arc<dyn JobStore>, Arc<dyn QueueBroker>, Arc<dyn EventSink>) =
        if config.profile.uses_in_memory_backends() {
            info!("Using in-memory broker and store");
            (
                Arc::new(MemoryJobStore::new()),
                Arc::new(InMemoryBroker::new()),
                Arc::new(BroadcastEvents::default()),
            )
        } else {
            let queue = &config.queue;
            (
                Arc::new(RedisJobStore::connect(&queue.redis_url, queue.key_prefix.clone()).await?),
                Arc::new(RedisBroker::connect(queue).await?),
                Arc::new(RedisEvents::new(&queue.redis_url, queue.key_prefix.clone())?),
            )
        };

    let ffmpeg = FfmpegEngine::detect()
        .await?
        .with_timeout(config.job_timeout.as_secs());
    let engine: Arc<dyn AudioEngine> = if config.engine_cache_bytes > 0 {
        Arc::new(CachedEngine::with_max_bytes(ffmpeg, config.engine_cache_bytes))
    } else {
        Arc::new(ffmpeg)
    };
    info!(
        engine_version = engine.version(),
        cache_bytes = config.engine_cache_bytes,
        "Audio engine ready"
    );

    let payloads = apipe_storage::payload_store_from_env()?;

    let dispatcher = Dispatcher::new(store, broker, events)
        .with_backoff(BackoffPolicy::from_config(&config))
        .with_max_attempts(config.max_attempts);

    Ok(ProcessingContext::new(
        config,
        Arc::new(dispatcher),
        payloads,
        engine,
    ))
}
