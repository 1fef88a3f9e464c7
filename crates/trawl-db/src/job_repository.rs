use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use trawl_core::error::AppError;
use trawl_core::job::{
    CreateJobRequest, IngestJob, JobCounts, JobKind, JobStatus, RecordCounts, RetryConfig,
};
use trawl_core::job_queue::JobQueue;

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// The pause switch lives in the single-row `queue_state` table so every
/// worker process observes it.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: Pool<Postgres>,
    default_max_retries: u32,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            default_max_retries: RetryConfig::default().max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

/// A state change that touched no row means the job moved on without us.
fn require_owned(rows_affected: u64, job_id: Uuid, worker_id: &str) -> Result<(), AppError> {
    if rows_affected == 0 {
        return Err(AppError::JobConflict(format!(
            "job {job_id} is not running under worker {worker_id}"
        )));
    }
    Ok(())
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct IngestJobRow {
    id: Uuid,
    seq: i64,
    source: String,
    url: String,
    kind: String,
    priority: i32,
    metadata: serde_json::Value,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    run_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    max_retries: i32,
    records_processed: i32,
    records_added: i32,
    records_updated: i32,
    records_failed: i32,
    error_message: Option<String>,
    worker_id: Option<String>,
}

impl From<IngestJobRow> for IngestJob {
    fn from(row: IngestJobRow) -> Self {
        IngestJob {
            id: row.id,
            seq: row.seq,
            source: row.source,
            url: row.url,
            // The CHECK constraint keeps these parseable; a single page is
            // the kind that can never retire listings.
            kind: row.kind.parse().unwrap_or(JobKind::SinglePage),
            priority: row.priority,
            metadata: row.metadata,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            created_at: row.created_at,
            updated_at: row.updated_at,
            run_at: row.run_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            counts: RecordCounts {
                processed: row.records_processed.max(0) as u32,
                added: row.records_added.max(0) as u32,
                updated: row.records_updated.max(0) as u32,
                failed: row.records_failed.max(0) as u32,
            },
            error_message: row.error_message,
            worker_id: row.worker_id,
        }
    }
}

impl JobQueue for PgJobQueue {
    async fn create_job(&self, request: CreateJobRequest) -> Result<IngestJob, AppError> {
        let delay_secs = request.delay.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        let row = sqlx::query_as::<_, IngestJobRow>(
            r#"
            INSERT INTO ingest_jobs (source, url, kind, priority, metadata, max_retries, run_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW() + make_interval(secs => $7))
            RETURNING *
            "#,
        )
        .bind(&request.source)
        .bind(&request.url)
        .bind(request.kind.as_str())
        .bind(request.priority)
        .bind(&request.metadata)
        .bind(request.max_retries.unwrap_or(self.default_max_retries) as i32)
        .bind(delay_secs)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.into())
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<IngestJob>, AppError> {
        let row = sqlx::query_as::<_, IngestJobRow>(
            r#"
            UPDATE ingest_jobs
            SET status = 'running', worker_id = $1, started_at = NOW(), updated_at = NOW()
            WHERE id = (
                SELECT id FROM ingest_jobs
                WHERE status = 'pending'
                  AND run_at <= NOW()
                  AND NOT EXISTS (SELECT 1 FROM queue_state WHERE paused)
                ORDER BY priority DESC, created_at ASC, seq ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'completed', completed_at = NOW(), updated_at = NOW(),
                records_processed = $2, records_added = $3,
                records_updated = $4, records_failed = $5,
                error_message = NULL, worker_id = NULL
            WHERE id = $1 AND status = 'running' AND worker_id = $6
            "#,
        )
        .bind(job_id)
        .bind(counts.processed as i32)
        .bind(counts.added as i32)
        .bind(counts.updated as i32)
        .bind(counts.failed as i32)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        require_owned(result.rows_affected(), job_id, worker_id)
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        // With a retry instant the job goes back to pending; otherwise it is
        // permanently failed.
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET
                status = CASE WHEN $3::timestamptz IS NOT NULL THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN $3::timestamptz IS NOT NULL THEN retry_count + 1 ELSE retry_count END,
                run_at = COALESCE($3::timestamptz, run_at),
                completed_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE NOW() END,
                started_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE started_at END,
                worker_id = NULL,
                error_message = $2,
                records_processed = $4, records_added = $5,
                records_updated = $6, records_failed = $7,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND worker_id = $8
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(next_retry_at)
        .bind(counts.processed as i32)
        .bind(counts.added as i32)
        .bind(counts.updated as i32)
        .bind(counts.failed as i32)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        require_owned(result.rows_affected(), job_id, worker_id)
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'cancelled', completed_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::JobConflict(format!(
                "job {job_id} is missing or no longer pending"
            )));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, AppError> {
        let row = sqlx::query_as::<_, IngestJobRow>(r#"SELECT * FROM ingest_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(Into::into))
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<IngestJob>, AppError> {
        let rows = sqlx::query_as::<_, IngestJobRow>(
            r#"
            SELECT * FROM ingest_jobs
            WHERE ($1::varchar IS NULL OR status = $1)
            ORDER BY created_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn requeue_stalled(&self, stall_timeout: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE status = 'running'
              AND started_at <= NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(stall_timeout.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            tracing::warn!(requeued, "Requeued stalled jobs");
        }
        Ok(requeued)
    }

    async fn retry_failed(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending', retry_count = 0, error_message = NULL,
                completed_at = NULL, run_at = NOW(), updated_at = NOW()
            WHERE status = 'failed'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }

    async fn pause(&self) -> Result<(), AppError> {
        set_paused(&self.pool, true).await
    }

    async fn resume(&self) -> Result<(), AppError> {
        set_paused(&self.pool, false).await
    }

    async fn is_paused(&self) -> Result<bool, AppError> {
        let (paused,): (bool,) = sqlx::query_as(
            r#"SELECT COALESCE((SELECT paused FROM queue_state WHERE id), FALSE)"#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(paused)
    }

    async fn counts(&self) -> Result<JobCounts, AppError> {
        let (waiting, delayed, active, completed, failed, cancelled): (i64, i64, i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'pending' AND run_at <= NOW()),
                    COUNT(*) FILTER (WHERE status = 'pending' AND run_at > NOW()),
                    COUNT(*) FILTER (WHERE status = 'running'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed'),
                    COUNT(*) FILTER (WHERE status = 'cancelled')
                FROM ingest_jobs
                "#,
            )
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(JobCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
            cancelled,
        })
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND COALESCE(completed_at, updated_at) < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(result.rows_affected())
    }
}

async fn set_paused(pool: &PgPool, paused: bool) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO queue_state (id, paused, updated_at) VALUES (TRUE, $1, NOW())
        ON CONFLICT (id) DO UPDATE SET paused = EXCLUDED.paused, updated_at = NOW()
        "#,
    )
    .bind(paused)
    .execute(pool)
    .await
    .map_err(db_err)?;

    tracing::info!(paused, "Queue dispatch switch changed");
    Ok(())
}
