//! Submit-to-result flows through the dispatcher and `process_lease`.

use std::sync::Arc;
use std::time::Duration;

use apipe_engine::CachedEngine;
use apipe_models::{ErrorKind, Feature, JobState, OperationSpec, PayloadRef, Priority};
use apipe_queue::QueueBroker;
use apipe_store::JobStore;
use apipe_worker::{LeaseOutcome, SubmitRequest};
use tokio::sync::Semaphore;

use super::support::{FakeEngine, MemoryPayloads, Pipeline, TestConfig, ENGINE_VERSION};

const SOURCE: &[u8] = b"RIFF\x24\x00\x00\x00WAVEfmt fake-pcm-data";

fn normalize(payload: PayloadRef) -> SubmitRequest {
    SubmitRequest::new(payload, OperationSpec::normalize())
}

#[tokio::test]
async fn test_normalize_end_to_end() {
    let engine = Arc::new(FakeEngine::new());
    let p = Pipeline::with_local_storage(engine.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let mut events = p.events.subscribe();

    let submission = p
        .dispatcher
        .submit(normalize(payload.clone()).with_key("k1"))
        .await
        .unwrap();
    assert!(submission.created);

    let outcome = p.drive_one("w1").await;
    assert_eq!(outcome, Some(LeaseOutcome::Succeeded));

    let status = p.dispatcher.status(&submission.job_id).await.unwrap();
    assert_eq!(status.job.state, JobState::Succeeded);
    assert_eq!(status.job.attempts, 0);

    let result = status.result.expect("result published with Succeeded");
    assert_eq!(result.metric("durationMs").and_then(|m| m.as_i64()), Some(1200));
    assert_eq!(result.engine_version, ENGINE_VERSION);

    let export = result.processed_ref.expect("normalize produces audio");
    // Keyed by the version the attempt held while Processing
    assert_eq!(
        export.key(),
        format!("exports/{}/{}.wav", submission.job_id, status.job.version - 1)
    );
    assert_eq!(status.job.result_ref.as_ref(), Some(&export));

    let stored = p.payloads.fetch(&export).await.unwrap();
    let expected: Vec<u8> = SOURCE.iter().rev().copied().collect();
    assert_eq!(stored, expected);

    // Same key while the job is live returns the same job
    let again = p
        .dispatcher
        .submit(normalize(payload).with_key("k1"))
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.job_id, submission.job_id);
    assert_eq!(engine.calls(), 1);

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.job_id, submission.job_id);
        states.push(event.state);
    }
    assert_eq!(
        states,
        vec![
            JobState::Queued,
            JobState::Leased,
            JobState::Processing,
            JobState::Succeeded
        ]
    );

    // Nothing left to lease
    assert!(!p.broker.contains(&submission.job_id).await.unwrap());
}

#[tokio::test]
async fn test_extract_features_stores_no_audio() {
    let p = Pipeline::new(Arc::new(FakeEngine::new()));
    let payload = p.upload("uploads/b.flac", SOURCE).await;

    let op = OperationSpec::ExtractFeatures {
        features: vec![Feature::Duration, Feature::SampleRate],
    };
    let submission = p
        .dispatcher
        .submit(SubmitRequest::new(payload, op))
        .await
        .unwrap();

    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Succeeded));

    let status = p.dispatcher.status(&submission.job_id).await.unwrap();
    assert_eq!(status.job.state, JobState::Succeeded);
    assert!(status.job.result_ref.is_none());

    let result = status.result.unwrap();
    assert!(result.processed_ref.is_none());
    assert_eq!(result.metric("sampleRate").and_then(|m| m.as_i64()), Some(48_000));
}

#[tokio::test]
async fn test_invalid_operation_rejected_at_submit() {
    let p = Pipeline::new(Arc::new(FakeEngine::new()));
    let payload = p.upload("uploads/a.wav", SOURCE).await;

    let op = OperationSpec::Normalize {
        target_lufs: 3.0,
        true_peak_db: -1.0,
    };
    let err = p
        .dispatcher
        .submit(SubmitRequest::new(payload, op))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::InvalidOperation);
    assert_eq!(p.broker.depth().await.unwrap().total(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_after_lost_lease() {
    let engine = Arc::new(FakeEngine::new());
    let p = Pipeline::new(engine.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    // A worker takes the job to Processing and then disappears
    let lost = p
        .broker
        .lease("crashed", p.ctx.config.visibility_timeout(), None)
        .await
        .unwrap()
        .unwrap();
    let mut job = p.job(&lost.job_id).await;
    job.lease().unwrap();
    let mut job = p.dispatcher.persist(&job, JobState::Queued).await.unwrap();
    job.start_processing().unwrap();
    p.dispatcher.persist(&job, JobState::Leased).await.unwrap();

    // Not visible until the visibility timeout passes
    assert!(p
        .broker
        .lease("w2", p.ctx.config.visibility_timeout(), None)
        .await
        .unwrap()
        .is_none());
    tokio::time::advance(p.ctx.config.visibility_timeout() + Duration::from_secs(1)).await;

    // The lost attempt counts as a failure and is retried
    let outcome = p.drive_one("w2").await;
    assert_eq!(
        outcome,
        Some(LeaseOutcome::Retried {
            delay: Duration::from_millis(100)
        })
    );
    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_ref().map(|e| e.kind), Some(ErrorKind::LeaseExpired));

    assert_eq!(p.drive_one("w2").await, Some(LeaseOutcome::Succeeded));
    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.attempts, 1);
    assert_eq!(engine.calls(), 1);

    // The crashed worker's token is stale
    assert!(p.broker.ack(&lost.token).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_retry_delays_grow_and_cap() {
    let engine = Arc::new(FakeEngine::new().always_failing());
    let config = TestConfig {
        max_attempts: 6,
        ..Default::default()
    };
    let p = Pipeline::with_config(engine.clone(), config);
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    let mut delays = Vec::new();
    loop {
        match p.drive_one("w1").await {
            Some(LeaseOutcome::Retried { delay }) => delays.push(delay),
            Some(LeaseOutcome::DeadLettered) => break,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    let ms: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
    assert_eq!(ms, vec![100, 200, 400, 800, 1000]);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));

    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(job.attempts, 6);
    assert_eq!(engine.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_job_is_dead_lettered_and_key_released() {
    let engine = Arc::new(FakeEngine::new().always_failing());
    let p = Pipeline::new(engine.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let first = p
        .dispatcher
        .submit(normalize(payload.clone()).with_key("k-dead"))
        .await
        .unwrap();

    assert!(matches!(p.drive_one("w1").await, Some(LeaseOutcome::Retried { .. })));
    assert!(matches!(p.drive_one("w1").await, Some(LeaseOutcome::Retried { .. })));
    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::DeadLettered));

    let job = p.job(&first.job_id).await;
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(job.attempts, 3);
    let error = job.last_error.expect("dead letter keeps the last error");
    assert_eq!(error.kind, ErrorKind::EngineFailure);

    let dead = p.dispatcher.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, first.job_id);
    assert!(!p.broker.contains(&first.job_id).await.unwrap());

    // A dead-lettered job no longer owns its key
    let second = p
        .dispatcher
        .submit(normalize(payload).with_key("k-dead"))
        .await
        .unwrap();
    assert!(second.created);
    assert_ne!(second.job_id, first.job_id);
}

#[tokio::test(start_paused = true)]
async fn test_missing_payload_fails_without_engine_call() {
    let engine = Arc::new(FakeEngine::new());
    let p = Pipeline::new(engine.clone());
    let submission = p
        .dispatcher
        .submit(normalize(PayloadRef::new("uploads/missing.wav")))
        .await
        .unwrap();

    let mut last = None;
    while let Some(outcome) = p.drive_one("w1").await {
        last = Some(outcome);
        if outcome == LeaseOutcome::DeadLettered {
            break;
        }
    }
    assert_eq!(last, Some(LeaseOutcome::DeadLettered));

    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::DeadLettered);
    assert_eq!(
        job.last_error.map(|e| e.kind),
        Some(ErrorKind::PayloadUnavailable)
    );
    assert_eq!(engine.calls(), 0);
}

#[tokio::test]
async fn test_cancel_queued_job_is_never_processed() {
    let engine = Arc::new(FakeEngine::new());
    let p = Pipeline::new(engine.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    let state = p.dispatcher.cancel(&submission.job_id).await.unwrap();
    assert_eq!(state, JobState::Cancelled);

    // The stale reference is acked on sight
    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Discarded));
    assert_eq!(engine.calls(), 0);
    assert_eq!(p.broker.depth().await.unwrap().total(), 0);

    // Cancelling again is a no-op
    let state = p.dispatcher.cancel(&submission.job_id).await.unwrap();
    assert_eq!(state, JobState::Cancelled);
}

#[tokio::test]
async fn test_cancel_during_processing_discards_output() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(FakeEngine::new().gated(gate.clone()));
    let p = Arc::new(Pipeline::new(engine.clone()));
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p
        .dispatcher
        .submit(normalize(payload.clone()).with_key("k-cancel"))
        .await
        .unwrap();

    let driver = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.drive_one("w1").await })
    };
    p.wait_for_state(&submission.job_id, JobState::Processing).await;

    // Mid-attempt the cancel is only recorded
    let state = p.dispatcher.cancel(&submission.job_id).await.unwrap();
    assert_eq!(state, JobState::Processing);
    assert!(p.job(&submission.job_id).await.cancel_requested);

    // The key is still owned by the Processing job
    let again = p
        .dispatcher
        .submit(normalize(payload.clone()).with_key("k-cancel"))
        .await
        .unwrap();
    assert!(!again.created);
    assert_eq!(again.job_id, submission.job_id);

    gate.add_permits(1);
    let outcome = driver.await.unwrap();
    assert_eq!(outcome, Some(LeaseOutcome::Cancelled));

    let status = p.dispatcher.status(&submission.job_id).await.unwrap();
    assert_eq!(status.job.state, JobState::Cancelled);
    assert!(status.result.is_none());
    assert!(p.store.get_result(&submission.job_id).await.unwrap().is_none());

    // Cancelled releases the key
    let next = p
        .dispatcher
        .submit(normalize(payload).with_key("k-cancel"))
        .await
        .unwrap();
    assert!(next.created);
}

#[tokio::test]
async fn test_identical_work_hits_engine_cache() {
    let fake = Arc::new(FakeEngine::new());
    let p = Pipeline::new(Arc::new(CachedEngine::new(Arc::clone(&fake))));
    let payload = p.upload("uploads/a.wav", SOURCE).await;

    let first = p
        .dispatcher
        .submit(normalize(payload.clone()).with_key("first"))
        .await
        .unwrap();
    let second = p
        .dispatcher
        .submit(normalize(payload).with_key("second"))
        .await
        .unwrap();
    assert_ne!(first.job_id, second.job_id);

    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Succeeded));
    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Succeeded));
    assert_eq!(fake.calls(), 1);

    let a = p.dispatcher.status(&first.job_id).await.unwrap().result.unwrap();
    let b = p.dispatcher.status(&second.job_id).await.unwrap().result.unwrap();
    assert_eq!(a.metrics, b.metrics);
    assert_ne!(a.processed_ref, b.processed_ref);
}

#[tokio::test]
async fn test_higher_priority_dispatched_first() {
    let engine = Arc::new(FakeEngine::new());
    let p = Pipeline::new(engine.clone());

    for (name, priority) in [
        ("low.wav", Priority::Low),
        ("normal.wav", Priority::Normal),
        ("high.wav", Priority::High),
    ] {
        let payload = p.upload(&format!("uploads/{}", name), SOURCE).await;
        p.dispatcher
            .submit(normalize(payload).with_priority(priority))
            .await
            .unwrap();
    }

    for _ in 0..3 {
        assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Succeeded));
    }
    assert_eq!(
        engine.seen(),
        vec!["uploads/high.wav", "uploads/normal.wav", "uploads/low.wav"]
    );
}

#[tokio::test]
async fn test_orphaned_queued_job_is_recovered() {
    let p = Pipeline::new(Arc::new(FakeEngine::new()));
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    // Broker loses the reference, e.g. a crash between insert and enqueue
    let lease = p
        .broker
        .lease("w", p.ctx.config.visibility_timeout(), None)
        .await
        .unwrap()
        .unwrap();
    p.broker.ack(&lease.token).await.unwrap();
    assert!(!p.broker.contains(&submission.job_id).await.unwrap());

    assert_eq!(p.dispatcher.recover_orphans().await.unwrap(), 1);
    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Succeeded));
}

#[tokio::test]
async fn test_stale_attempt_keeps_published_export() {
    let gate = Arc::new(Semaphore::new(0));
    let payloads = Arc::new(MemoryPayloads::default().holding_exports(gate.clone(), 1));
    let engine = Arc::new(FakeEngine::new());
    let config = TestConfig {
        visibility_timeout: Duration::from_millis(200),
        base_delay: Duration::from_millis(20),
        ..Default::default()
    };
    let p = Arc::new(Pipeline::with_payloads(engine.clone(), config, payloads.clone()));
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    // First attempt stalls in its upload until its lease runs out
    let stalled = {
        let p = Arc::clone(&p);
        tokio::spawn(async move { p.drive_one("w1").await })
    };
    p.wait_for_state(&submission.job_id, JobState::Processing).await;
    while engine.calls() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(250)).await;

    // A second worker reclaims it, a third finishes it
    assert!(matches!(p.drive_one("w2").await, Some(LeaseOutcome::Retried { .. })));
    assert_eq!(p.drive_one("w3").await, Some(LeaseOutcome::Succeeded));
    let published = p.job(&submission.job_id).await.result_ref.unwrap();
    assert!(payloads.contains(published.key()).await);

    gate.add_permits(1);
    assert_eq!(stalled.await.unwrap(), Some(LeaseOutcome::Discarded));

    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::Succeeded);
    assert_eq!(job.result_ref.as_ref(), Some(&published));
    assert!(payloads.contains(published.key()).await);
    assert_eq!(
        payloads.keys().await,
        vec![published.key().to_string(), "uploads/a.wav".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_stuck_export_upload_counts_against_job_timeout() {
    let gate = Arc::new(Semaphore::new(0));
    let payloads = Arc::new(MemoryPayloads::default().holding_exports(gate, 1));
    let config = TestConfig {
        job_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let p = Pipeline::with_payloads(Arc::new(FakeEngine::new()), config, payloads.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p.dispatcher.submit(normalize(payload)).await.unwrap();

    let started = tokio::time::Instant::now();
    assert_eq!(p.drive_one("w1").await, Some(LeaseOutcome::Abandoned));
    assert!(started.elapsed() < Duration::from_secs(3));

    // Left for the visibility timeout; nothing published
    let job = p.job(&submission.job_id).await;
    assert_eq!(job.state, JobState::Processing);
    assert!(job.result_ref.is_none());
    assert!(p.store.get_result(&submission.job_id).await.unwrap().is_none());
    assert_eq!(payloads.keys().await, vec!["uploads/a.wav".to_string()]);
}
