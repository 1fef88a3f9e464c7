use std::future::Future;
use std::sync::Arc;

use serde::Serialize;

use crate::dedup::dedupe_batch;
use crate::error::AppError;
use crate::job::{IngestJob, RecordCounts};
use crate::logsink::{LogEntry, LogLevel, LogSink};
use crate::models::CanonicalRecord;
use crate::registry::AdapterRegistry;
use crate::traits::{ChangeNotifier, ListingStore, TracingNotifier};
use crate::validate::{RejectedRecord, Validator};

/// Coarse progress milestones of one pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    FetchStarted,
    FetchCompleted { records: usize, skipped: usize },
    Normalized { records: usize },
    Validated { accepted: usize, rejected: usize },
    Stored { inserted: u32, updated: u32 },
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::FetchStarted => "fetch_started",
            Stage::FetchCompleted { .. } => "fetch_completed",
            Stage::Normalized { .. } => "normalized",
            Stage::Validated { .. } => "validated",
            Stage::Stored { .. } => "stored",
        }
    }
}

/// Receives [`Stage`] milestones as the pipeline reaches them.
pub trait StageObserver: Send + Sync {
    fn stage(&self, job: &IngestJob, stage: Stage) -> impl Future<Output = ()> + Send;
}

/// Observer that ignores every milestone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoStages;

impl StageObserver for NoStages {
    async fn stage(&self, _job: &IngestJob, _stage: Stage) {}
}

/// Outcome of one successful run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineReport {
    pub counts: RecordCounts,
    pub skipped_elements: usize,
    pub duplicates: usize,
    pub unchanged: u32,
    pub deactivated: u64,
    pub rejected: Vec<RejectedRecord>,
}

/// A failed run: the error plus whatever was counted before it struck.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct PipelineFailure {
    pub error: AppError,
    pub counts: RecordCounts,
}

/// Drives one job through adapter → normalizer → validator → deduplicator
/// → store.
pub struct IngestPipeline<S: ListingStore> {
    registry: AdapterRegistry,
    store: S,
    validator: Validator,
    notifier: Arc<dyn ChangeNotifier>,
    log: LogSink,
}

impl<S: ListingStore> IngestPipeline<S> {
    pub fn new(registry: AdapterRegistry, store: S) -> Self {
        Self {
            registry,
            store,
            validator: Validator::default(),
            notifier: Arc::new(TracingNotifier),
            log: LogSink::disabled(),
        }
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_log_sink(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn log(&self, job: &IngestJob, level: LogLevel, message: String, metadata: serde_json::Value) {
        self.log.log(
            LogEntry::new(level, &job.source, message)
                .for_job(job.id)
                .with_metadata(metadata),
        );
    }

    /// Run `job` to completion. Per-record problems end up in the report;
    /// only adapter, configuration and storage failures are errors. A
    /// failure is written to the log sink and carries the partial counts.
    pub async fn run<O: StageObserver>(
        &self,
        job: &IngestJob,
        observer: &O,
    ) -> Result<PipelineReport, PipelineFailure> {
        let mut counts = RecordCounts::default();
        match self.execute(job, observer, &mut counts).await {
            Ok(report) => Ok(report),
            Err(error) => {
                self.log(
                    job,
                    LogLevel::Error,
                    format!("Job failed: {error}"),
                    serde_json::json!({
                        "url": job.url,
                        "kind": job.kind.to_string(),
                        "attempt": job.retry_count + 1,
                        "counts": counts,
                    }),
                );
                Err(PipelineFailure { error, counts })
            }
        }
    }

    async fn execute<O: StageObserver>(
        &self,
        job: &IngestJob,
        observer: &O,
        counts: &mut RecordCounts,
    ) -> Result<PipelineReport, AppError> {
        let source = self.registry.get(&job.source)?;
        let full_sweep = job.kind.is_full_sweep();
        if full_sweep {
            source.adapter.clear_session();
        }

        observer.stage(job, Stage::FetchStarted).await;
        tracing::info!(job_id = %job.id, source = %job.source, url = %job.url, kind = %job.kind, "Fetching");
        let outcome = source.adapter.fetch(&job.url).await?;

        let raw_count = outcome.records.len();
        counts.processed = raw_count as u32;
        let fetched_ids: Vec<String> = outcome
            .records
            .iter()
            .filter_map(|r| r.external_id.clone())
            .collect();
        observer
            .stage(
                job,
                Stage::FetchCompleted {
                    records: raw_count,
                    skipped: outcome.skipped.len(),
                },
            )
            .await;
        for skipped in &outcome.skipped {
            self.log(
                job,
                LogLevel::Warn,
                format!("Skipped element {}: {}", skipped.index, skipped.reason),
                serde_json::json!({ "url": job.url }),
            );
        }

        let normalized: Vec<CanonicalRecord> = outcome
            .records
            .iter()
            .map(|raw| source.normalizer.normalize(raw))
            .collect();
        observer
            .stage(job, Stage::Normalized { records: normalized.len() })
            .await;

        // Everything observed counts as still live, even if rejected below.
        let observed_ids: Vec<String> = normalized
            .iter()
            .filter(|r| !r.external_id.is_empty())
            .map(|r| r.external_id.clone())
            .collect();

        let batch = self.validator.validate_batch(&normalized);
        counts.failed = batch.rejected.len() as u32;
        observer
            .stage(
                job,
                Stage::Validated {
                    accepted: batch.accepted.len(),
                    rejected: batch.rejected.len(),
                },
            )
            .await;
        for rejected in &batch.rejected {
            self.log(
                job,
                LogLevel::Warn,
                format!("Rejected record '{}'", rejected.external_id),
                serde_json::json!({ "errors": rejected.errors }),
            );
        }

        let deduped = dedupe_batch(batch.accepted);
        if !deduped.duplicates.is_empty() {
            tracing::debug!(job_id = %job.id, duplicates = deduped.duplicates.len(), "Dropped in-batch duplicates");
        }

        let upsert = self.store.upsert(&deduped.unique).await?;
        counts.added = upsert.inserted;
        counts.updated = upsert.updated;
        // Only stored records count as seen; a failed batch is re-emitted on retry.
        source.adapter.commit_seen(&fetched_ids);
        observer
            .stage(
                job,
                Stage::Stored {
                    inserted: upsert.inserted,
                    updated: upsert.updated,
                },
            )
            .await;
        for change in &upsert.changes {
            self.notifier.notify(change);
        }

        let deactivated = if !full_sweep {
            0
        } else if raw_count == 0 {
            self.log(
                job,
                LogLevel::Warn,
                "Full sweep returned no records; skipping inactive marking".into(),
                serde_json::Value::Null,
            );
            0
        } else {
            self.store.mark_inactive(&job.source, &observed_ids).await?
        };

        let report = PipelineReport {
            counts: *counts,
            skipped_elements: outcome.skipped.len(),
            duplicates: deduped.duplicates.len(),
            unchanged: upsert.skipped,
            deactivated,
            rejected: batch.rejected,
        };

        tracing::info!(
            job_id = %job.id,
            source = %job.source,
            processed = report.counts.processed,
            added = report.counts.added,
            updated = report.counts.updated,
            failed = report.counts.failed,
            deactivated,
            "Pipeline run finished"
        );
        self.log(
            job,
            LogLevel::Info,
            format!(
                "Processed {} records: {} added, {} updated, {} failed",
                report.counts.processed,
                report.counts.added,
                report.counts.updated,
                report.counts.failed
            ),
            serde_json::to_value(report.counts)?,
        );

        Ok(report)
    }
}
