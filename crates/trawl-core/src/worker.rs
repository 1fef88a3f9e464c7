use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{IngestJob, JobStatus, RecordCounts, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::pipeline::{IngestPipeline, Stage, StageObserver};
use crate::traits::{JobStatusFields, JobStatusSink, ListingStore};

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling,
    JobClaimed {
        job: &'a IngestJob,
    },
    Progress {
        job_id: Uuid,
        stage: Stage,
    },
    JobCompleted {
        job_id: Uuid,
        counts: RecordCounts,
    },
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                tracing::trace!("Polling for jobs");
            }
            WorkerEvent::JobClaimed { job } => {
                tracing::info!(
                    job_id = %job.id,
                    source = %job.source,
                    kind = %job.kind,
                    attempt = job.retry_count + 1,
                    "Job claimed"
                );
            }
            WorkerEvent::Progress { job_id, stage } => {
                tracing::debug!(%job_id, stage = stage.label(), ?stage, "Job progress");
            }
            WorkerEvent::JobCompleted { job_id, counts } => {
                tracing::info!(
                    %job_id,
                    processed = counts.processed,
                    added = counts.added,
                    updated = counts.updated,
                    failed = counts.failed,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(%job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Forwards pipeline milestones to the reporter and the status sink.
struct JobProgress<'a, WR: WorkerReporter> {
    reporter: &'a WR,
    status: &'a dyn JobStatusSink,
}

impl<WR: WorkerReporter> StageObserver for JobProgress<'_, WR> {
    async fn stage(&self, job: &IngestJob, stage: Stage) {
        self.reporter.report(WorkerEvent::Progress {
            job_id: job.id,
            stage,
        });
        let fields = JobStatusFields {
            progress: Some(stage.label()),
            ..Default::default()
        };
        if let Err(e) = self
            .status
            .update_job_status(job.id, JobStatus::Running, fields)
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to publish job progress");
        }
    }
}

/// Worker that polls the job queue and runs ingestion jobs one at a time.
pub struct WorkerService<Q, S>
where
    Q: JobQueue,
    S: ListingStore,
{
    queue: Q,
    pipeline: Arc<IngestPipeline<S>>,
    status: Arc<dyn JobStatusSink>,
    config: WorkerConfig,
}

impl<Q, S> WorkerService<Q, S>
where
    Q: JobQueue,
    S: ListingStore,
{
    pub fn new(
        queue: Q,
        pipeline: Arc<IngestPipeline<S>>,
        status: Arc<dyn JobStatusSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            pipeline,
            status,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker loop until cancellation. The job in progress when
    /// cancellation fires is finished first.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling);

            match self.queue.claim_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    reporter.report(WorkerEvent::JobClaimed { job: &job });
                    self.process_job(&job, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Anything still held by this worker goes back to pending.
        let released = self
            .queue
            .release_worker_jobs(&self.config.worker_id)
            .await
            .unwrap_or(0);

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    async fn publish(&self, job_id: Uuid, status: JobStatus, fields: JobStatusFields) {
        if let Err(e) = self.status.update_job_status(job_id, status, fields).await {
            tracing::warn!(%job_id, error = %e, "Failed to publish job status");
        }
    }

    pub(crate) async fn process_job<WR: WorkerReporter>(&self, job: &IngestJob, reporter: &WR) {
        self.publish(job.id, JobStatus::Running, JobStatusFields::default())
            .await;

        let progress = JobProgress {
            reporter,
            status: self.status.as_ref(),
        };

        match self.pipeline.run(job, &progress).await {
            Ok(report) => {
                reporter.report(WorkerEvent::JobCompleted {
                    job_id: job.id,
                    counts: report.counts,
                });
                if let Err(e) = self
                    .queue
                    .complete_job(job.id, &self.config.worker_id, report.counts)
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                    return;
                }
                self.publish(
                    job.id,
                    JobStatus::Completed,
                    JobStatusFields {
                        counts: Some(report.counts),
                        ..Default::default()
                    },
                )
                .await;
            }
            Err(failure) => {
                let error_msg = failure.error.to_string();
                let will_retry = job.can_retry() && !failure.error.is_terminal();
                reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &error_msg,
                    will_retry,
                });

                let next_retry = will_retry
                    .then(|| job.calculate_next_retry(&self.config.retry_config));

                if let Err(e) = self
                    .queue
                    .fail_job(
                        job.id,
                        &self.config.worker_id,
                        &error_msg,
                        next_retry,
                        failure.counts,
                    )
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                    return;
                }
                let status = if will_retry {
                    JobStatus::Pending
                } else {
                    JobStatus::Failed
                };
                self.publish(
                    job.id,
                    status,
                    JobStatusFields {
                        counts: Some(failure.counts),
                        error: Some(error_msg),
                        ..Default::default()
                    },
                )
                .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;
    use crate::job::{JobKind, RetryConfig};
    use crate::logsink::LogSink;
    use crate::memory::{InMemoryListingStore, InMemoryLogStore};
    use crate::normalize::FieldMapNormalizer;
    use crate::registry::AdapterRegistry;
    use crate::traits::LogStore;
    use crate::testutil::{
        MockAdapter, MockJobQueue, RecordingReporter, RecordingStatusSink, make_test_job,
        raw_listing,
    };

    fn worker(
        queue: MockJobQueue,
        adapter: MockAdapter,
        status: RecordingStatusSink,
    ) -> WorkerService<MockJobQueue, InMemoryListingStore> {
        let registry = AdapterRegistry::new()
            .register(Arc::new(adapter), Arc::new(FieldMapNormalizer::default()));
        let pipeline = Arc::new(IngestPipeline::new(registry, InMemoryListingStore::new()));
        WorkerService::new(
            queue,
            pipeline,
            Arc::new(status),
            WorkerConfig::default()
                .with_worker_id("test-worker")
                .with_poll_interval(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn successful_job_is_completed_with_counts() {
        let job = make_test_job("board", JobKind::Incremental);
        let queue = MockJobQueue::with_job(job.clone());
        let status = RecordingStatusSink::default();
        let adapter = MockAdapter::new("board")
            .with_records(vec![raw_listing("board", "1", "Backend Intern")]);
        let svc = worker(queue.clone(), adapter, status.clone());

        svc.process_job(&job, &RecordingReporter::default()).await;

        let completed = queue.completed_jobs.lock().unwrap();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1.added, 1);
        assert_eq!(status.last_status(job.id), Some(JobStatus::Completed));
        assert!(status.progress(job.id).contains(&"stored"));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_growing_backoff_then_fails() {
        let status = RecordingStatusSink::default();
        let adapter = MockAdapter::new("board").with_error(AppError::NetworkError("reset".into()));
        let queue = MockJobQueue::empty();
        let svc = worker(queue.clone(), adapter, status.clone());

        let mut job = make_test_job("board", JobKind::Incremental);
        job.max_retries = RetryConfig::default().max_retries;
        for attempt in 0..=job.max_retries {
            job.retry_count = attempt;
            svc.process_job(&job, &RecordingReporter::default()).await;
        }

        let failed = queue.failed_jobs.lock().unwrap();
        assert_eq!(failed.len(), 4);
        let retries: Vec<_> = failed[..3].iter().map(|(_, _, at, _)| at.unwrap()).collect();
        assert!(retries[0] < retries[1] && retries[1] < retries[2]);
        assert!(retries[0] > Utc::now());
        assert!(failed[3].2.is_none(), "exhausted job must not be rescheduled");
        assert_eq!(status.last_status(job.id), Some(JobStatus::Failed));
    }

    #[tokio::test]
    async fn failed_job_keeps_partial_counts_and_reaches_log_store() {
        let job = make_test_job("board", JobKind::Incremental);
        let queue = MockJobQueue::with_job(job.clone());
        let adapter = MockAdapter::new("board").with_records(vec![
            raw_listing("board", "1", "Backend Intern"),
            raw_listing("board", "bad", "Data Intern"),
        ]);
        let store = InMemoryListingStore::new();
        store.fail_batches_with("bad");
        let log_store = InMemoryLogStore::new();
        let cancel = CancellationToken::new();
        let (sink, flusher) = LogSink::spawn(log_store.clone(), Default::default(), cancel.clone());
        let registry = AdapterRegistry::new()
            .register(Arc::new(adapter), Arc::new(FieldMapNormalizer::default()));
        let pipeline = Arc::new(IngestPipeline::new(registry, store).with_log_sink(sink));
        let svc = WorkerService::new(
            queue.clone(),
            pipeline,
            Arc::new(RecordingStatusSink::default()),
            WorkerConfig::default().with_worker_id("test-worker"),
        );

        svc.process_job(&job, &RecordingReporter::default()).await;

        let failed = queue.failed_jobs.lock().unwrap().clone();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].1.contains("Transaction failed"));
        assert_eq!(failed[0].3.processed, 2);
        assert_eq!(failed[0].3.added, 0);

        cancel.cancel();
        flusher.await.unwrap();
        let stats = log_store.stats(Utc::now() - chrono::TimeDelta::hours(1)).await.unwrap();
        assert_eq!(stats.recent_errors.len(), 1);
        assert_eq!(stats.recent_errors[0].job_id, Some(job.id));
    }

    #[tokio::test]
    async fn unknown_source_is_not_retried() {
        let queue = MockJobQueue::empty();
        let svc = worker(queue.clone(), MockAdapter::new("board"), RecordingStatusSink::default());
        let job = make_test_job("missing", JobKind::Incremental);

        let reporter = RecordingReporter::default();
        svc.process_job(&job, &reporter).await;

        let failed = queue.failed_jobs.lock().unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].1.contains("Unknown source"));
        assert!(failed[0].2.is_none());
        assert_eq!(reporter.failures(), vec![false]);
    }

    #[tokio::test]
    async fn worker_stops_on_cancel_and_releases_jobs() {
        let queue = MockJobQueue::empty();
        let svc = worker(queue.clone(), MockAdapter::new("board"), RecordingStatusSink::default());
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { svc.run(cancel, &TracingWorkerReporter).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        handle.await.unwrap().unwrap();
        assert_eq!(
            queue.released_workers.lock().unwrap().as_slice(),
            ["test-worker".to_string()]
        );
    }

    #[tokio::test]
    async fn worker_processes_claimed_job() {
        let job = make_test_job("board", JobKind::Incremental);
        let queue = MockJobQueue::with_job(job);
        let adapter = MockAdapter::new("board")
            .with_records(vec![raw_listing("board", "1", "Backend Intern")]);
        let svc = worker(queue.clone(), adapter, RecordingStatusSink::default());
        let cancel = CancellationToken::new();

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { svc.run(cancel, &TracingWorkerReporter).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(queue.completed_jobs.lock().unwrap().len(), 1);
    }
}
