//! Engine over the SQLite store, end to end: jobs fire from durable
//! records, and a process restart resumes from what the store says.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use jobmill_core::{
    ActionRegistry, JobAction, JobState, NewJob, SchedulerConfig, SchedulerEngine, TriggerSpec,
};
use jobmill_sqlite::SqliteJobStore;

fn counting_registry() -> (Arc<ActionRegistry>, Arc<AtomicU32>) {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let mut registry = ActionRegistry::new();
    registry.register("count", move |_ctx| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });
    (Arc::new(registry), calls)
}

fn config() -> SchedulerConfig {
    SchedulerConfig::new().with_persist_retry(3, Duration::from_millis(1))
}

#[tokio::test]
async fn interval_job_fires_and_resumes_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    // First process: add an interval job and let it fire once.
    {
        let store = Arc::new(SqliteJobStore::from_path(&path).await.unwrap());
        let (registry, calls) = counting_registry();
        let engine = SchedulerEngine::new(store, registry, config());
        let handle = engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(engine.run(shutdown.clone()));

        let job = NewJob::new("tick", TriggerSpec::interval(1), JobAction::new("count"))
            .with_id("tick");
        handle.add_job(job).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);

        let record = handle.get_job("tick").await.unwrap().unwrap();
        assert!(record.run_count >= 1);
        assert!(record.next_run_at.is_some());

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    // Second process: reconciliation restores the job from the store and
    // keeps firing it; the counters continue where they left off.
    let store = Arc::new(SqliteJobStore::from_path(&path).await.unwrap());
    let (registry, calls) = counting_registry();
    let engine = SchedulerEngine::new(store, registry, config());
    let handle = engine.handle();
    let shutdown = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);

    let record = handle.get_job("tick").await.unwrap().unwrap();
    assert!(record.run_count >= 2);

    shutdown.cancel();
    engine_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn paused_job_stays_paused_across_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("jobs.db");

    {
        let store = Arc::new(SqliteJobStore::from_path(&path).await.unwrap());
        let (registry, _calls) = counting_registry();
        let engine = SchedulerEngine::new(store, registry, config());
        let handle = engine.handle();
        let shutdown = CancellationToken::new();
        let engine_task = tokio::spawn(engine.run(shutdown.clone()));

        let job = NewJob::new("held", TriggerSpec::interval(1), JobAction::new("count"))
            .with_id("held");
        handle.add_job(job).await.unwrap();
        handle.pause_job("held").await.unwrap();

        shutdown.cancel();
        engine_task.await.unwrap().unwrap();
    }

    let store = Arc::new(SqliteJobStore::from_path(&path).await.unwrap());
    let (registry, calls) = counting_registry();
    let engine = SchedulerEngine::new(store, registry, config());
    let handle = engine.handle();
    let shutdown = CancellationToken::new();
    let engine_task = tokio::spawn(engine.run(shutdown.clone()));

    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let record = handle.get_job("held").await.unwrap().unwrap();
    assert_eq!(record.state, JobState::Paused);
    assert!(record.next_run_at.is_none());

    // Resuming schedules it again without a restart.
    handle.resume_job("held").await.unwrap();
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert!(calls.load(Ordering::SeqCst) >= 1);

    shutdown.cancel();
    engine_task.await.unwrap().unwrap();
}
