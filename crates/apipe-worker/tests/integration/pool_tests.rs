//! Worker pool supervision and shutdown.

use std::sync::Arc;
use std::time::Duration;

use apipe_models::{JobState, OperationSpec};
use apipe_worker::SubmitRequest;
use tokio::sync::Semaphore;

use super::support::{FakeEngine, Pipeline, TestConfig};

const SOURCE: &[u8] = b"RIFF-pool-test";

fn small_pool() -> TestConfig {
    TestConfig {
        concurrency: 1,
        visibility_timeout: Duration::from_millis(300),
        job_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_executor_restarted_after_panic() {
    let engine = Arc::new(FakeEngine::new().panicking(1));
    let p = Pipeline::with_config(engine.clone(), small_pool());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p
        .dispatcher
        .submit(SubmitRequest::new(payload, OperationSpec::normalize()))
        .await
        .unwrap();

    let pool = p.pool();
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };

    // The panicked attempt is reclaimed by the visibility timeout and
    // retried on the restarted executor
    let job = p.wait_for_state(&submission.job_id, JobState::Succeeded).await;
    assert_eq!(job.attempts, 1);
    assert_eq!(engine.calls(), 2);

    pool.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_job_finish() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(FakeEngine::new().gated(gate.clone()));
    let p = Pipeline::new(engine.clone());
    let payload = p.upload("uploads/a.wav", SOURCE).await;
    let submission = p
        .dispatcher
        .submit(SubmitRequest::new(payload, OperationSpec::normalize()))
        .await
        .unwrap();

    let pool = p.pool();
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };
    p.wait_for_state(&submission.job_id, JobState::Processing).await;

    pool.shutdown();
    assert!(pool.is_shutting_down());

    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(1);

    runner.await.unwrap().unwrap();
    assert_eq!(p.job(&submission.job_id).await.state, JobState::Succeeded);
}

#[tokio::test]
async fn test_executors_run_jobs_concurrently() {
    let gate = Arc::new(Semaphore::new(0));
    let engine = Arc::new(FakeEngine::new().gated(gate.clone()));
    let p = Pipeline::new(engine.clone());

    let mut ids = Vec::new();
    for name in ["a.wav", "b.wav"] {
        let payload = p.upload(&format!("uploads/{}", name), SOURCE).await;
        let submission = p
            .dispatcher
            .submit(SubmitRequest::new(payload, OperationSpec::normalize()))
            .await
            .unwrap();
        ids.push(submission.job_id);
    }

    let pool = p.pool();
    let runner = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.run().await })
    };

    // Both held at once by the two executors
    for id in &ids {
        p.wait_for_state(id, JobState::Processing).await;
    }
    gate.add_permits(2);
    for id in &ids {
        p.wait_for_state(id, JobState::Succeeded).await;
    }

    pool.shutdown();
    runner.await.unwrap().unwrap();
}
