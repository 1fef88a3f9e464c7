use async_trait::async_trait;
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use trawl_core::error::AppError;
use trawl_core::job::JobStatus;
use trawl_core::traits::{JobStatusFields, JobStatusSink};

/// Writes the latest status of each job into `job_history`.
///
/// Fields absent from a report keep their previously recorded value.
#[derive(Clone)]
pub struct PgJobStatusSink {
    pool: Pool<Postgres>,
}

impl PgJobStatusSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read back the recorded status and progress label of a job.
    pub async fn latest(&self, job_id: Uuid) -> Result<Option<(JobStatus, Option<String>)>, AppError> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as(r#"SELECT status, progress FROM job_history WHERE job_id = $1"#)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(|(status, progress)| {
            (status.parse().unwrap_or(JobStatus::Pending), progress)
        }))
    }
}

#[async_trait]
impl JobStatusSink for PgJobStatusSink {
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: JobStatusFields,
    ) -> Result<(), AppError> {
        let counts = fields.counts;
        sqlx::query(
            r#"
            INSERT INTO job_history (
                job_id, status, progress, records_processed, records_added,
                records_updated, records_failed, error_message, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (job_id) DO UPDATE SET
                status = EXCLUDED.status,
                progress = COALESCE(EXCLUDED.progress, job_history.progress),
                records_processed = COALESCE(EXCLUDED.records_processed, job_history.records_processed),
                records_added = COALESCE(EXCLUDED.records_added, job_history.records_added),
                records_updated = COALESCE(EXCLUDED.records_updated, job_history.records_updated),
                records_failed = COALESCE(EXCLUDED.records_failed, job_history.records_failed),
                error_message = COALESCE(EXCLUDED.error_message, job_history.error_message),
                updated_at = NOW()
            "#,
        )
        .bind(job_id)
        .bind(status.as_str())
        .bind(fields.progress)
        .bind(counts.map(|c| c.processed as i32))
        .bind(counts.map(|c| c.added as i32))
        .bind(counts.map(|c| c.updated as i32))
        .bind(counts.map(|c| c.failed as i32))
        .bind(fields.error)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(())
    }
}
