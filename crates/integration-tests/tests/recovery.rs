//! Crash recovery and retention against a file-backed SQLite store

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cadence_core::application::{
    shutdown_channel, LeaseReaper, QueueHandle, RetentionSweeper, WorkerEngine,
};
use cadence_core::domain::{Job, JobState, KeepJobs, QueueOptions, RetentionPolicy, WorkerConfig};
use cadence_core::port::id_provider::UuidProvider;
use cadence_core::port::time_provider::SystemTimeProvider;
use cadence_core::port::{handler_fn, JobStore};
use cadence_infra_sqlite::SqliteJobStore;
use common::TempDb;
use serde_json::json;

fn queue(store: Arc<SqliteJobStore>, name: &str) -> QueueHandle {
    QueueHandle::new(
        name,
        QueueOptions::critical(),
        store,
        Arc::new(UuidProvider),
        Arc::new(SystemTimeProvider),
    )
    .unwrap()
}

/// A job left ACTIVE by a dead process is returned to WAITING on the next
/// startup and then processed.
#[tokio::test]
async fn test_orphaned_job_recovered_after_restart() {
    let db = TempDb::new();

    // Process 1 claims the job and dies without finishing it
    let orphan = {
        let store = db.open(4).await;
        let handle = queue(store.clone(), "notifications")
            .enqueue(&json!({"source_id": "feed-1"}), None)
            .await
            .unwrap();
        let claimed = store.claim_next("notifications", 50).await.unwrap().unwrap();
        assert_eq!(claimed.id, handle.id);
        store.close().await.unwrap();
        handle.id
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Process 2
    let store = db.open(4).await;
    let job = store.find_by_id(&orphan).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Active);

    let reaper = LeaseReaper::new(store.clone(), Duration::from_secs(15));
    assert_eq!(reaper.reap_once().await.unwrap(), 1);
    let job = store.find_by_id(&orphan).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Waiting);
    assert_eq!(job.attempts_made, 0);

    let handler = handler_fn(|_job: Job| async { Ok(()) });
    let engine = Arc::new(
        WorkerEngine::new(
            WorkerConfig::new("notifications", 1),
            store.clone(),
            Arc::new(handler),
        )
        .unwrap(),
    );
    let mut events = engine.subscribe();
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let worker = tokio::spawn(engine.run(shutdown_rx));

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.job_id(), orphan);

    shutdown_tx.shutdown();
    worker.await.unwrap().unwrap();
    let job = store.find_by_id(&orphan).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);

    store.close().await.unwrap();
}

/// The heartbeat keeps renewing the lease of a handler that outlives it
#[tokio::test]
async fn test_heartbeat_prevents_reclaim_of_long_job() {
    let db = TempDb::new();
    let store = db.open(4).await;
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let handler = handler_fn(move |_job: Job| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(800)).await;
            Ok(())
        }
    });
    let handle = queue(store.clone(), "check-sources")
        .enqueue(&json!({}), None)
        .await
        .unwrap();

    let engine = Arc::new(
        WorkerEngine::new(
            WorkerConfig::new("check-sources", 1).with_lease_duration(Duration::from_millis(200)),
            store.clone(),
            Arc::new(handler),
        )
        .unwrap(),
    );
    let mut events = engine.subscribe();
    let (shutdown_tx, shutdown_rx) = shutdown_channel();
    let worker = tokio::spawn(engine.run(shutdown_rx));

    let reaper = LeaseReaper::new(store.clone(), Duration::from_millis(50));
    let mut reclaimed = 0;
    let completed = loop {
        tokio::select! {
            event = events.recv() => break event.unwrap(),
            _ = tokio::time::sleep(Duration::from_millis(50)) => {
                reclaimed += reaper.reap_once().await.unwrap();
            }
        }
    };

    assert_eq!(completed.job_id(), handle.id);
    assert_eq!(reclaimed, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    shutdown_tx.shutdown();
    worker.await.unwrap().unwrap();
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_retention_sweep_keeps_newest_finished_jobs() {
    let db = TempDb::new();
    let store = db.open(4).await;
    let queue = queue(store.clone(), "check-sources");

    for i in 0..5 {
        queue.enqueue(&json!({"n": i}), None).await.unwrap();
    }
    let mut finished = Vec::new();
    for _ in 0..5 {
        let job = store.claim_next("check-sources", 30_000).await.unwrap().unwrap();
        store
            .complete(&job.id, job.lease_token.as_deref().unwrap())
            .await
            .unwrap();
        finished.push(job.id);
        // distinct finished_at ordering
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    queue.enqueue(&json!({"n": "pending"}), None).await.unwrap();

    let retention = RetentionPolicy {
        completed: KeepJobs::new(2, Duration::from_secs(3600)),
        failed: KeepJobs::new(10, Duration::from_secs(3600)),
    };
    let sweeper = RetentionSweeper::new(
        store.clone(),
        vec![("check-sources".to_string(), retention)],
        Duration::from_secs(300),
    );

    let stats = sweeper.run_now().await.unwrap();
    assert_eq!(stats.total(), 3);

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.waiting, 1);
    assert!(store.find_by_id(&finished[0]).await.unwrap().is_none());
    assert!(store.find_by_id(&finished[4]).await.unwrap().is_some());

    store.close().await.unwrap();
}
