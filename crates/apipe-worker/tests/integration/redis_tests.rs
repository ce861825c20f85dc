//! Pipeline against a real Redis.

use std::sync::Arc;
use std::time::Duration;

use apipe_models::{JobState, OperationSpec, PayloadRef, Priority};
use apipe_queue::{QueueBroker, QueueConfig, RedisBroker};
use apipe_storage::PayloadStore;
use apipe_store::{JobStore, NoopEvents, RedisJobStore};
use apipe_worker::{
    process_lease, BackoffPolicy, Dispatcher, LeaseOutcome, ProcessingContext, SubmitRequest,
};

use super::support::{FakeEngine, MemoryPayloads, TestConfig};

/// Queue config with a prefix no other run shares.
fn isolated_config() -> QueueConfig {
    dotenvy::dotenv().ok();
    QueueConfig {
        key_prefix: format!("apipe-test-{}", uuid::Uuid::new_v4()),
        visibility_timeout: Duration::from_secs(30),
        ..QueueConfig::from_env()
    }
}

async fn redis_context(queue: &QueueConfig) -> (Arc<ProcessingContext>, Arc<MemoryPayloads>) {
    let store = RedisJobStore::connect(&queue.redis_url, queue.key_prefix.clone())
        .await
        .expect("Failed to connect job store");
    let broker = RedisBroker::connect(queue)
        .await
        .expect("Failed to connect broker");

    let mut worker_config = TestConfig::default().worker_config();
    worker_config.queue = queue.clone();

    let dispatcher = Dispatcher::new(Arc::new(store), Arc::new(broker), Arc::new(NoopEvents))
        .with_backoff(BackoffPolicy::from_config(&worker_config))
        .with_max_attempts(worker_config.max_attempts);
    let payloads = Arc::new(MemoryPayloads::default());
    let ctx = ProcessingContext::new(
        worker_config,
        Arc::new(dispatcher),
        payloads.clone(),
        Arc::new(FakeEngine::new()),
    );
    (Arc::new(ctx), payloads)
}

/// Submit, lease, process and read back a job through Redis.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_end_to_end() {
    let queue = isolated_config();
    let (ctx, payloads) = redis_context(&queue).await;
    let payload = payloads
        .put("uploads/a.wav", b"RIFF-redis".to_vec(), "audio/wav")
        .await
        .unwrap();

    let request = SubmitRequest::new(payload.clone(), OperationSpec::normalize()).with_key("k1");
    let submission = ctx.dispatcher.submit(request.clone()).await.unwrap();
    assert!(submission.created);

    // Duplicate while live
    let again = ctx.dispatcher.submit(request).await.unwrap();
    assert_eq!(again.job_id, submission.job_id);
    assert!(!again.created);

    let lease = ctx
        .dispatcher
        .broker()
        .lease("w1", queue.visibility_timeout, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("job should be leasable");
    assert_eq!(lease.job_id, submission.job_id);
    assert_eq!(lease.delivery_count, 1);

    assert_eq!(process_lease(&ctx, lease).await, LeaseOutcome::Succeeded);

    let status = ctx.dispatcher.status(&submission.job_id).await.unwrap();
    assert_eq!(status.job.state, JobState::Succeeded);
    let result = status.result.expect("result stored");
    assert_eq!(result.metric("durationMs").and_then(|m| m.as_i64()), Some(1200));

    let processed = result.processed_ref.expect("processed audio stored");
    assert!(payloads.contains(processed.key()).await);
    assert!(!ctx
        .dispatcher
        .broker()
        .contains(&submission.job_id)
        .await
        .unwrap());
}

/// Nacked jobs come back after their delay, high priority first.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_broker_ordering_and_nack() {
    let queue = isolated_config();
    let broker = RedisBroker::connect(&queue)
        .await
        .expect("Failed to connect broker");

    let low = apipe_models::JobId::new();
    let high = apipe_models::JobId::new();
    broker.enqueue(&low, Priority::Low).await.unwrap();
    broker.enqueue(&high, Priority::High).await.unwrap();
    // Already held, ignored
    broker.enqueue(&high, Priority::High).await.unwrap();

    let depth = broker.depth().await.unwrap();
    assert_eq!(depth.ready(), 2);

    let first = broker
        .lease("w", queue.visibility_timeout, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.job_id, high);

    broker
        .nack(&first.token, Duration::from_millis(300))
        .await
        .unwrap();
    assert!(broker.ack(&first.token).await.is_err());

    let second = broker
        .lease("w", queue.visibility_timeout, None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.job_id, low);
    broker.ack(&second.token).await.unwrap();

    let again = broker
        .lease("w", queue.visibility_timeout, Some(Duration::from_secs(2)))
        .await
        .unwrap()
        .expect("nacked job visible after its delay");
    assert_eq!(again.job_id, high);
    assert_eq!(again.delivery_count, 2);
    broker.ack(&again.token).await.unwrap();
}

/// Store compare-and-set rejects a stale writer.
#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_store_compare_and_set() {
    let queue = isolated_config();
    let store = RedisJobStore::connect(&queue.redis_url, queue.key_prefix.clone())
        .await
        .expect("Failed to connect job store");

    let job = apipe_models::Job::new(
        PayloadRef::new("uploads/a.wav"),
        OperationSpec::normalize(),
        None,
        Priority::Normal,
    );
    let created = store.insert_or_get(job).await.unwrap().into_job();

    let mut leased = created.clone();
    leased.lease().unwrap();
    let written = store.compare_and_set(&leased, JobState::Queued).await.unwrap();
    assert_eq!(written.version, created.version + 1);

    // Same expected state, stale version
    let err = store
        .compare_and_set(&leased, JobState::Queued)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}
