use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info_span};

use crate::error::AppError;
use crate::job::WorkerConfig;
use crate::job_queue::JobQueue;
use crate::pipeline::IngestPipeline;
use crate::traits::{JobStatusSink, ListingStore};
use crate::worker::{WorkerReporter, WorkerService};

const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// A fixed-size set of workers sharing one queue, plus a stall reaper.
pub struct WorkerPool<Q, S>
where
    Q: JobQueue,
    S: ListingStore,
{
    queue: Q,
    pipeline: Arc<IngestPipeline<S>>,
    status: Arc<dyn JobStatusSink>,
    config: WorkerConfig,
    reaper_interval: Duration,
}

impl<Q, S> WorkerPool<Q, S>
where
    Q: JobQueue + 'static,
    S: ListingStore + 'static,
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
            reaper_interval: DEFAULT_REAPER_INTERVAL,
        }
    }

    /// How often running jobs are checked against `stall_timeout`.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Spawn `concurrency` workers named `{worker_id}-{n}` and the reaper.
    /// Everything stops when `cancel` fires; in-flight jobs finish first.
    pub fn start<WR>(self, cancel: CancellationToken, reporter: Arc<WR>) -> PoolHandle
    where
        WR: WorkerReporter + 'static,
    {
        let mut workers = Vec::with_capacity(self.config.concurrency);
        for i in 1..=self.config.concurrency.max(1) {
            let name = format!("{}-{i}", self.config.worker_id);
            tracing::info!(worker_id = %name, "Starting worker");

            let service = WorkerService::new(
                self.queue.clone(),
                Arc::clone(&self.pipeline),
                Arc::clone(&self.status),
                self.config.clone().with_worker_id(name.clone()),
            );
            let cancel = cancel.clone();
            let reporter = Arc::clone(&reporter);
            let span = info_span!("worker", worker_id = %name);
            workers.push(tokio::spawn(
                async move { service.run(cancel, reporter.as_ref()).await }.instrument(span),
            ));
        }

        let reaper = tokio::spawn(stall_reaper(
            self.queue,
            self.config.stall_timeout,
            self.reaper_interval,
            cancel,
        ));

        PoolHandle { workers, reaper }
    }
}

async fn stall_reaper<Q: JobQueue>(
    queue: Q,
    stall_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            () = cancel.cancelled() => break,
        }
        match queue.requeue_stalled(stall_timeout).await {
            Ok(0) => {}
            Ok(n) => tracing::warn!(requeued = n, "Requeued stalled jobs"),
            Err(e) => tracing::error!(error = %e, "Stall sweep failed"),
        }
    }
}

/// Handle to a running [`WorkerPool`].
pub struct PoolHandle {
    workers: Vec<JoinHandle<Result<(), AppError>>>,
    reaper: JoinHandle<()>,
}

impl PoolHandle {
    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Wait for every worker and the reaper to exit.
    pub async fn wait_for_shutdown(self) {
        for result in join_all(self.workers).await {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "Worker exited with error"),
                Err(e) => tracing::warn!(error = %e, "Worker task panicked"),
            }
        }
        if let Err(e) = self.reaper.await {
            tracing::warn!(error = %e, "Stall reaper task panicked");
        }
    }
}
