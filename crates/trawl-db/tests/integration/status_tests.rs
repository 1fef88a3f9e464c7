use trawl_core::job::{JobStatus, RecordCounts};
use trawl_core::traits::{JobStatusFields, JobStatusSink};
use trawl_db::PgJobStatusSink;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

#[tokio::test]
async fn later_reports_keep_earlier_fields() {
    let (pool, _container) = setup_test_db().await;
    let sink = PgJobStatusSink::new(pool.clone());
    let job_id = Uuid::new_v4();

    sink.update_job_status(
        job_id,
        JobStatus::Running,
        JobStatusFields {
            progress: Some("fetch_completed"),
            ..JobStatusFields::default()
        },
    )
    .await
    .unwrap();
    sink.update_job_status(
        job_id,
        JobStatus::Completed,
        JobStatusFields {
            counts: Some(RecordCounts {
                processed: 3,
                added: 1,
                updated: 1,
                failed: 1,
            }),
            ..JobStatusFields::default()
        },
    )
    .await
    .unwrap();

    let (status, progress) = sink.latest(job_id).await.unwrap().unwrap();
    assert_eq!(status, JobStatus::Completed);
    assert_eq!(progress.as_deref(), Some("fetch_completed"));

    let (processed, failed): (Option<i32>, Option<i32>) = sqlx::query_as(
        "SELECT records_processed, records_failed FROM job_history WHERE job_id = $1",
    )
    .bind(job_id)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!((processed, failed), (Some(3), Some(1)));
}

#[tokio::test]
async fn unknown_job_has_no_history() {
    let (pool, _container) = setup_test_db().await;
    let sink = PgJobStatusSink::new(pool);
    assert!(sink.latest(Uuid::new_v4()).await.unwrap().is_none());
}
