use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, IngestJob, JobCounts, JobStatus, RecordCounts};

/// Persistent job queue for ingestion jobs.
///
/// Implementations must support atomic claiming via `SELECT FOR UPDATE SKIP LOCKED`
/// or equivalent to prevent multiple workers from claiming the same job.
/// Dispatch order is priority descending, then enqueue order.
pub trait JobQueue: Send + Sync + Clone {
    fn create_job(
        &self,
        request: CreateJobRequest,
    ) -> impl Future<Output = Result<IngestJob, AppError>> + Send;

    /// Atomically claim the next eligible pending job for processing.
    ///
    /// Returns `None` if no jobs are available or the queue is paused.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<IngestJob>, AppError>> + Send;

    /// Mark a running job completed. Fails with [`AppError::JobConflict`]
    /// unless the job is running under `worker_id`.
    fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        counts: RecordCounts,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failed attempt. If `next_retry_at` is provided, the job is
    /// reset to `pending` and becomes eligible again at that instant;
    /// otherwise it is marked as permanently `failed`. Same ownership rule
    /// as [`JobQueue::complete_job`].
    fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        counts: RecordCounts,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Cancel a job that has not started. Running and terminal jobs are
    /// refused with [`AppError::JobConflict`].
    fn cancel_job(&self, job_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    fn get_job(
        &self,
        job_id: Uuid,
    ) -> impl Future<Output = Result<Option<IngestJob>, AppError>> + Send;

    fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<IngestJob>, AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Return running jobs whose `started_at` is older than `stall_timeout`
    /// to `pending`. Used to recover jobs orphaned by a crashed worker.
    fn requeue_stalled(
        &self,
        stall_timeout: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Move every `failed` job back to `pending` with a fresh retry budget.
    fn retry_failed(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn pause(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn resume(&self) -> impl Future<Output = Result<(), AppError>> + Send;

    fn is_paused(&self) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn counts(&self) -> impl Future<Output = Result<JobCounts, AppError>> + Send;

    /// Delete terminal jobs finished before `older_than`.
    fn purge_finished(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
