use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use trawl_core::error::AppError;
use trawl_core::job::{CreateJobRequest, JobKind, JobStatus, RecordCounts};
use trawl_core::job_queue::JobQueue;
use trawl_db::PgJobQueue;

use crate::integration::common::setup_test_db;

fn test_request() -> CreateJobRequest {
    CreateJobRequest::new("test-board", "https://test-board.example.com/jobs", JobKind::FullScrape)
}

fn counts(processed: u32) -> RecordCounts {
    RecordCounts {
        processed,
        added: processed,
        updated: 0,
        failed: 0,
    }
}

#[tokio::test]
async fn create_job_and_verify_fields() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue
        .create_job(test_request().with_metadata(serde_json::json!({"recurring": "nightly"})))
        .await
        .unwrap();

    assert_eq!(job.source, "test-board");
    assert_eq!(job.kind, JobKind::FullScrape);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.priority, 0);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, 3);
    assert_eq!(job.metadata["recurring"], "nightly");
    assert_eq!(job.counts, RecordCounts::default());
    assert!(job.run_at <= Utc::now());
    assert!(job.worker_id.is_none());
}

#[tokio::test]
async fn claim_prefers_priority_then_enqueue_order() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let low = queue.create_job(test_request()).await.unwrap();
    let high = queue.create_job(test_request().with_priority(5)).await.unwrap();
    let low_second = queue.create_job(test_request()).await.unwrap();

    let order: Vec<_> = [
        queue.claim_job("w").await.unwrap().unwrap().id,
        queue.claim_job("w").await.unwrap().unwrap().id,
        queue.claim_job("w").await.unwrap().unwrap().id,
    ]
    .into();
    assert_eq!(order, vec![high.id, low.id, low_second.id]);
    assert!(queue.claim_job("w").await.unwrap().is_none());
}

#[tokio::test]
async fn delayed_job_is_not_claimable_yet() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue
        .create_job(test_request().with_delay(Duration::from_secs(3600)))
        .await
        .unwrap();
    assert!(job.run_at > Utc::now() + TimeDelta::minutes(59));

    assert!(queue.claim_job("w").await.unwrap().is_none());
    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.waiting, 0);
}

#[tokio::test]
async fn paused_queue_dispatches_nothing_until_resumed() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    queue.create_job(test_request()).await.unwrap();
    queue.pause().await.unwrap();
    assert!(queue.is_paused().await.unwrap());
    assert!(queue.claim_job("w").await.unwrap().is_none());

    queue.resume().await.unwrap();
    assert!(!queue.is_paused().await.unwrap());
    assert!(queue.claim_job("w").await.unwrap().is_some());
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    for _ in 0..5 {
        queue.create_job(test_request()).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            queue.claim_job(&format!("worker-{i}")).await.unwrap()
        }));
    }

    let mut claimed = HashSet::new();
    for handle in handles {
        if let Some(job) = handle.await.unwrap() {
            assert!(claimed.insert(job.id), "job {} claimed twice", job.id);
        }
    }
    assert_eq!(claimed.len(), 5);
}

#[tokio::test]
async fn complete_job_records_counts() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();
    queue.complete_job(job.id, "worker-1", counts(7)).await.unwrap();

    let updated = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Completed);
    assert_eq!(updated.counts.processed, 7);
    assert_eq!(updated.counts.added, 7);
    assert!(updated.completed_at.is_some());
    assert!(updated.worker_id.is_none());
}

#[tokio::test]
async fn fail_job_with_retry_resets_to_pending() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();

    let next_retry = Utc::now() + TimeDelta::minutes(5);
    queue
        .fail_job(job.id, "worker-1", "temporary error", Some(next_retry), counts(2))
        .await
        .unwrap();

    let updated = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Pending);
    assert_eq!(updated.retry_count, 1);
    assert!(updated.run_at > Utc::now());
    assert_eq!(updated.error_message.as_deref(), Some("temporary error"));
    assert_eq!(updated.counts.processed, 2);
    assert!(updated.worker_id.is_none());

    // Backoff holds it back from dispatch.
    assert!(queue.claim_job("worker-2").await.unwrap().is_none());
}

#[tokio::test]
async fn fail_job_without_retry_marks_failed() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();
    queue
        .fail_job(job.id, "worker-1", "permanent error", None, RecordCounts::default())
        .await
        .unwrap();

    let updated = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Failed);
    assert_eq!(updated.retry_count, 0);
    assert!(updated.completed_at.is_some());
    assert_eq!(updated.error_message.as_deref(), Some("permanent error"));
}

#[tokio::test]
async fn terminal_jobs_are_immutable() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();
    queue.complete_job(job.id, "worker-1", counts(3)).await.unwrap();

    assert!(matches!(
        queue.cancel_job(job.id).await,
        Err(AppError::JobConflict(_))
    ));
    assert!(matches!(
        queue
            .fail_job(job.id, "worker-1", "late failure", None, RecordCounts::default())
            .await,
        Err(AppError::JobConflict(_))
    ));

    let updated = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Completed);
    assert_eq!(updated.counts.processed, 3);
    assert!(updated.error_message.is_none());
}

#[tokio::test]
async fn cancel_pending_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.cancel_job(job.id).await.unwrap();

    let updated = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(updated.status, JobStatus::Cancelled);
    assert!(queue.claim_job("worker-1").await.unwrap().is_none());
}

#[tokio::test]
async fn running_job_cannot_be_cancelled() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();

    let refused = queue.cancel_job(job.id).await;
    assert!(matches!(refused, Err(AppError::JobConflict(_))));
    let current = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert_eq!(current.worker_id.as_deref(), Some("worker-1"));
}

#[tokio::test]
async fn stale_worker_cannot_complete_or_fail_requeued_job() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-a").await.unwrap();
    queue.requeue_stalled(Duration::ZERO).await.unwrap();
    let reclaimed = queue.claim_job("worker-b").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, job.id);

    let stale = queue.complete_job(job.id, "worker-a", counts(1)).await;
    assert!(matches!(stale, Err(AppError::JobConflict(_))));
    let stale = queue
        .fail_job(job.id, "worker-a", "late", Some(Utc::now()), RecordCounts::default())
        .await;
    assert!(matches!(stale, Err(AppError::JobConflict(_))));

    let current = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(current.status, JobStatus::Running);
    assert_eq!(current.retry_count, 0);
    assert_eq!(current.worker_id.as_deref(), Some("worker-b"));

    queue.complete_job(job.id, "worker-b", counts(1)).await.unwrap();
    assert_eq!(
        queue.get_job(job.id).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[tokio::test]
async fn release_worker_jobs_on_shutdown() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    queue.create_job(test_request()).await.unwrap();
    queue.create_job(test_request()).await.unwrap();
    queue.claim_job("worker-1").await.unwrap();
    queue.claim_job("worker-1").await.unwrap();

    let released = queue.release_worker_jobs("worker-1").await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(queue.counts().await.unwrap().waiting, 2);
}

#[tokio::test]
async fn stalled_jobs_are_requeued() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool.clone());

    let stalled = queue.create_job(test_request()).await.unwrap();
    let fresh = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("crashed").await.unwrap();
    queue.claim_job("alive").await.unwrap();

    sqlx::query("UPDATE ingest_jobs SET started_at = NOW() - INTERVAL '2 hours' WHERE id = $1")
        .bind(stalled.id)
        .execute(&pool)
        .await
        .unwrap();

    let requeued = queue.requeue_stalled(Duration::from_secs(1800)).await.unwrap();
    assert_eq!(requeued, 1);

    let stalled = queue.get_job(stalled.id).await.unwrap().unwrap();
    assert_eq!(stalled.status, JobStatus::Pending);
    assert!(stalled.worker_id.is_none());
    let fresh = queue.get_job(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh.status, JobStatus::Running);
}

#[tokio::test]
async fn retry_failed_resets_attempts() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let job = queue.create_job(test_request()).await.unwrap();
    queue.claim_job("w").await.unwrap();
    queue
        .fail_job(job.id, "w", "first", Some(Utc::now() - TimeDelta::seconds(1)), RecordCounts::default())
        .await
        .unwrap();
    queue.claim_job("w").await.unwrap();
    queue
        .fail_job(job.id, "w", "gave up", None, RecordCounts::default())
        .await
        .unwrap();

    assert_eq!(queue.retry_failed().await.unwrap(), 1);

    let job = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.retry_count, 0);
    assert!(job.error_message.is_none());
    assert!(queue.claim_job("w").await.unwrap().is_some());
}

#[tokio::test]
async fn counts_and_list_by_status() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool);

    let a = queue.create_job(test_request()).await.unwrap();
    queue.create_job(test_request()).await.unwrap();
    queue.create_job(test_request()).await.unwrap();
    queue.cancel_job(a.id).await.unwrap();
    queue.claim_job("w").await.unwrap();

    let counts = queue.counts().await.unwrap();
    assert_eq!(counts.active, 1);
    assert_eq!(counts.cancelled, 1);
    assert_eq!(counts.waiting, 1);

    let pending = queue.list_jobs(Some(JobStatus::Pending), 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    let all = queue.list_jobs(None, 10).await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn purge_removes_only_old_terminal_jobs() {
    let (pool, _container) = setup_test_db().await;
    let queue = PgJobQueue::new(pool.clone());

    let old = queue.create_job(test_request()).await.unwrap();
    let recent = queue.create_job(test_request()).await.unwrap();
    let pending = queue.create_job(test_request()).await.unwrap();
    queue.cancel_job(old.id).await.unwrap();
    queue.cancel_job(recent.id).await.unwrap();

    sqlx::query("UPDATE ingest_jobs SET completed_at = NOW() - INTERVAL '30 days' WHERE id = $1")
        .bind(old.id)
        .execute(&pool)
        .await
        .unwrap();

    let purged = queue
        .purge_finished(Utc::now() - TimeDelta::days(7))
        .await
        .unwrap();
    assert_eq!(purged, 1);
    assert!(queue.get_job(old.id).await.unwrap().is_none());
    assert!(queue.get_job(recent.id).await.unwrap().is_some());
    assert!(queue.get_job(pending.id).await.unwrap().is_some());
}
