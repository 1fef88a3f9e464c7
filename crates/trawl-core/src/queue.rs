use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, IngestJob, JobKind};
use crate::job_queue::JobQueue;
use crate::registry::AdapterRegistry;
use crate::scheduler::{RecurringScheduler, parse_schedule};

/// Snapshot of queue state for operators.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueHealth {
    pub active: i64,
    pub waiting: i64,
    pub delayed: i64,
    pub failed: i64,
    pub completed: i64,
    pub cancelled: i64,
    pub paused: bool,
}

/// Submission surface over a [`JobQueue`]: checks requests against the
/// known source names before they reach storage, and owns recurring triggers.
#[derive(Clone)]
pub struct IngestQueue<Q: JobQueue> {
    queue: Q,
    sources: Arc<BTreeSet<String>>,
    scheduler: RecurringScheduler,
}

impl<Q: JobQueue + 'static> IngestQueue<Q> {
    /// Accept jobs for every source registered in `registry`.
    pub fn new(queue: Q, registry: &AdapterRegistry) -> Self {
        Self::for_sources(queue, registry.names())
    }

    /// Accept jobs for the named sources without building their adapters.
    /// Operator tooling uses this; the worker builds the full registry.
    pub fn for_sources(queue: Q, sources: impl IntoIterator<Item = String>) -> Self {
        Self {
            queue,
            sources: Arc::new(sources.into_iter().collect()),
            scheduler: RecurringScheduler::new(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: RecurringScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn inner(&self) -> &Q {
        &self.queue
    }

    pub fn scheduler(&self) -> &RecurringScheduler {
        &self.scheduler
    }

    fn check(&self, request: &CreateJobRequest) -> Result<(), AppError> {
        if !self.sources.contains(&request.source) {
            return Err(AppError::ValidationError(format!(
                "No adapter registered for source '{}'",
                request.source
            )));
        }
        let url = url::Url::parse(&request.url)
            .map_err(|e| AppError::ValidationError(format!("Invalid URL '{}': {e}", request.url)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AppError::ValidationError(format!(
                "Unsupported URL scheme '{}'",
                url.scheme()
            )));
        }
        Ok(())
    }

    pub async fn enqueue(&self, request: CreateJobRequest) -> Result<Uuid, AppError> {
        self.check(&request)?;
        let job = self.queue.create_job(request).await?;
        tracing::info!(
            job_id = %job.id,
            source = %job.source,
            kind = %job.kind,
            priority = job.priority,
            run_at = %job.run_at,
            "Job enqueued"
        );
        Ok(job.id)
    }

    /// Enqueue from an untyped payload. The `kind` string is parsed first so an
    /// unknown kind is reported as such rather than as a generic decode error.
    pub async fn enqueue_json(&self, payload: serde_json::Value) -> Result<Uuid, AppError> {
        let kind = payload
            .get("kind")
            .and_then(|k| k.as_str())
            .ok_or_else(|| AppError::ValidationError("Missing job kind".into()))?;
        JobKind::from_str(kind)?;
        let request: CreateJobRequest = serde_json::from_value(payload)
            .map_err(|e| AppError::ValidationError(format!("Malformed job request: {e}")))?;
        self.enqueue(request).await
    }

    /// Enqueue a copy of `template` on every firing of the cron `schedule`.
    /// Re-registering a name replaces the previous trigger.
    pub fn enqueue_recurring(
        &self,
        name: &str,
        template: CreateJobRequest,
        schedule: &str,
    ) -> Result<(), AppError> {
        self.check(&template)?;
        let schedule = parse_schedule(schedule)?;

        let queue = self.clone();
        let trigger = name.to_string();
        self.scheduler.schedule(name, schedule, move |fired_at| {
            let queue = queue.clone();
            let trigger = trigger.clone();
            let mut request = template.clone();
            if let Some(meta) = request.metadata.as_object_mut() {
                meta.insert("recurring".into(), serde_json::Value::String(trigger.clone()));
            }
            async move {
                if let Err(e) = queue.enqueue(request).await {
                    tracing::error!(schedule = %trigger, %fired_at, error = %e, "Recurring enqueue failed");
                }
            }
        });
        tracing::info!(schedule = %name, "Recurring job registered");
        Ok(())
    }

    pub fn cancel_recurring(&self, name: &str) -> bool {
        self.scheduler.cancel(name)
    }

    pub async fn pause(&self) -> Result<(), AppError> {
        self.queue.pause().await?;
        tracing::info!("Queue paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), AppError> {
        self.queue.resume().await?;
        tracing::info!("Queue resumed");
        Ok(())
    }

    pub async fn retry_failed(&self) -> Result<u64, AppError> {
        let n = self.queue.retry_failed().await?;
        tracing::info!(requeued = n, "Failed jobs requeued");
        Ok(n)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<(), AppError> {
        self.queue.cancel_job(job_id).await
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<IngestJob>, AppError> {
        self.queue.get_job(job_id).await
    }

    pub async fn health(&self) -> Result<QueueHealth, AppError> {
        let counts = self.queue.counts().await?;
        let paused = self.queue.is_paused().await?;
        Ok(QueueHealth {
            active: counts.active,
            waiting: counts.waiting,
            delayed: counts.delayed,
            failed: counts.failed,
            completed: counts.completed,
            cancelled: counts.cancelled,
            paused,
        })
    }

    /// Delete finished jobs older than `older_than`.
    pub async fn purge(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        self.queue.purge_finished(older_than).await
    }
}
