#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Coordination store tests with several handles on one database file,
//! the way separate processes share it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use nerfhub_daemon::coordination::{CoordinationError, Coordinator};
use nerfhub_daemon::storage::{Database, JobProgress, JobStatus, PublishOutcome};

async fn open(path: &std::path::Path) -> Coordinator {
    Coordinator::new(Database::open(path).await.unwrap())
}

#[tokio::test]
async fn stop_request_from_controller_aborts_next_publish() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordination.db");
    let worker = open(&path).await;
    let controller = open(&path).await;

    let first = JobProgress::running("export", 10, 100);
    assert_eq!(
        worker.publish_progress_or_abort("k1", &first).await.unwrap(),
        PublishOutcome::Published
    );
    assert_eq!(controller.progress("k1").await.unwrap().unwrap().completed, 10);

    controller.request_stop("k1").await.unwrap();
    let second = JobProgress::running("export", 20, 100);
    assert_eq!(
        worker.publish_progress_or_abort("k1", &second).await.unwrap(),
        PublishOutcome::Aborted
    );
    assert_eq!(controller.progress("k1").await.unwrap(), Some(first));

    // The marker was consumed; a new job under the same key runs normally.
    assert_eq!(
        worker.publish_progress_or_abort("k1", &second).await.unwrap(),
        PublishOutcome::Published
    );
}

#[tokio::test]
async fn reporter_surfaces_abort_as_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordination.db");
    let worker = open(&path).await;
    let controller = open(&path).await;
    let reporter = worker.reporter("k1");

    reporter
        .report(&JobProgress::running("export", 1, 3))
        .await
        .unwrap();
    controller.request_stop("k1").await.unwrap();
    let err = reporter
        .report(&JobProgress::running("export", 2, 3))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::Aborted { key } if key == "k1"));

    reporter
        .finish(JobProgress::running("export", 1, 3).with_status(JobStatus::Cancelled))
        .await
        .unwrap();
    assert_eq!(
        controller.progress("k1").await.unwrap().unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lock_is_exclusive_across_handles() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordination.db");
    let holders = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let coordinator = open(&path).await;
        let holders = Arc::clone(&holders);
        let completed = Arc::clone(&completed);
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                let token = coordinator
                    .acquire("gpu", Duration::from_secs(20), Duration::from_secs(60))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                assert!(coordinator.release("gpu", &token).await.unwrap());
                completed.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(completed.load(Ordering::SeqCst), 12);
}

#[tokio::test]
async fn crashed_owner_lock_expires() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("coordination.db");
    let crashed = open(&path).await;
    let next = open(&path).await;

    let stale = crashed
        .try_acquire("gpu", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();
    assert!(
        next.try_acquire("gpu", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none()
    );

    let token = next
        .acquire("gpu", Duration::from_secs(2), Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert!(!crashed.release("gpu", &stale).await.unwrap());
    assert!(next.release("gpu", &token).await.unwrap());
}
