//! In-process implementations of the storage traits.
//!
//! Used by unit tests and by the queue/pipeline test suites in place of a
//! database. Semantics match the Postgres implementations in
//! `trawl-db`, including terminal-state immutability and all-or-nothing
//! batch upserts.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{CreateJobRequest, IngestJob, JobCounts, JobStatus, RecordCounts, RetryConfig};
use crate::job_queue::JobQueue;
use crate::logsink::{LogEntry, LogLevel, LogQuery, LogStats, RECENT_ERRORS};
use crate::models::{CanonicalRecord, ChangeEvent, ChangeKind, Listing, NaturalKey, UpsertReport};
use crate::traits::{ListingStore, LogStore};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// InMemoryJobQueue
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct QueueState {
    jobs: HashMap<Uuid, IngestJob>,
    next_seq: i64,
    paused: bool,
}

#[derive(Debug, Clone)]
pub struct InMemoryJobQueue {
    state: Arc<Mutex<QueueState>>,
    default_max_retries: u32,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            default_max_retries: RetryConfig::default().max_retries,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }
}

/// The job `worker_id` is currently running, or a conflict.
fn owned_job<'a>(
    state: &'a mut QueueState,
    job_id: Uuid,
    worker_id: &str,
) -> Result<&'a mut IngestJob, AppError> {
    match state.jobs.get_mut(&job_id) {
        Some(job)
            if job.status == JobStatus::Running && job.worker_id.as_deref() == Some(worker_id) =>
        {
            Ok(job)
        }
        Some(job) => Err(AppError::JobConflict(format!(
            "job {job_id} is {} and not held by {worker_id}",
            job.status
        ))),
        None => Err(AppError::JobConflict(format!("job {job_id} not found"))),
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue for InMemoryJobQueue {
    async fn create_job(&self, request: CreateJobRequest) -> Result<IngestJob, AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        state.next_seq += 1;
        let job = IngestJob {
            id: Uuid::new_v4(),
            seq: state.next_seq,
            run_at: request.run_at(now),
            source: request.source,
            url: request.url,
            kind: request.kind,
            priority: request.priority,
            metadata: request.metadata,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(self.default_max_retries),
            counts: RecordCounts::default(),
            error_message: None,
            worker_id: None,
        };
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<IngestJob>, AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        if state.paused {
            return Ok(None);
        }

        let next = state
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.updated_at = now;
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let job = owned_job(&mut state, job_id, worker_id)?;
        job.status = JobStatus::Completed;
        job.counts = counts;
        job.completed_at = Some(now);
        job.updated_at = now;
        job.error_message = None;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let job = owned_job(&mut state, job_id, worker_id)?;
        job.error_message = Some(error.to_string());
        job.counts = counts;
        job.updated_at = now;
        match next_retry_at {
            Some(at) => {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.run_at = at;
                job.started_at = None;
                job.worker_id = None;
            }
            None => {
                job.status = JobStatus::Failed;
                job.completed_at = Some(now);
            }
        }
        Ok(())
    }

    async fn cancel_job(&self, job_id: Uuid) -> Result<(), AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        match state.jobs.get_mut(&job_id) {
            Some(job) if job.status == JobStatus::Pending => {
                job.status = JobStatus::Cancelled;
                job.completed_at = Some(now);
                job.updated_at = now;
                Ok(())
            }
            Some(job) => Err(AppError::JobConflict(format!(
                "job {job_id} is {} and cannot be cancelled",
                job.status
            ))),
            None => Err(AppError::JobConflict(format!("job {job_id} not found"))),
        }
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, AppError> {
        Ok(lock(&self.state).jobs.get(&job_id).cloned())
    }

    async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<IngestJob>, AppError> {
        let state = lock(&self.state);
        let mut jobs: Vec<IngestJob> = state
            .jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.seq.cmp(&a.seq)));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let mut released = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running && job.worker_id.as_deref() == Some(worker_id) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                job.updated_at = now;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn requeue_stalled(&self, stall_timeout: Duration) -> Result<u64, AppError> {
        let now = Utc::now();
        let Some(cutoff) = TimeDelta::from_std(stall_timeout)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let mut state = lock(&self.state);
        let mut requeued = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running && job.started_at.is_some_and(|t| t <= cutoff) {
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn retry_failed(&self) -> Result<u64, AppError> {
        let now = Utc::now();
        let mut state = lock(&self.state);
        let mut retried = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Failed {
                job.status = JobStatus::Pending;
                job.retry_count = 0;
                job.error_message = None;
                job.completed_at = None;
                job.run_at = now;
                job.updated_at = now;
                retried += 1;
            }
        }
        Ok(retried)
    }

    async fn pause(&self) -> Result<(), AppError> {
        lock(&self.state).paused = true;
        Ok(())
    }

    async fn resume(&self) -> Result<(), AppError> {
        lock(&self.state).paused = false;
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, AppError> {
        Ok(lock(&self.state).paused)
    }

    async fn counts(&self) -> Result<JobCounts, AppError> {
        let now = Utc::now();
        let state = lock(&self.state);
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            match job.status {
                JobStatus::Pending if job.run_at <= now => counts.waiting += 1,
                JobStatus::Pending => counts.delayed += 1,
                JobStatus::Running => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn purge_finished(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut state = lock(&self.state);
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.unwrap_or(job.updated_at) < older_than)
        });
        Ok((before - state.jobs.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// InMemoryListingStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryListingStore {
    listings: Arc<Mutex<HashMap<NaturalKey, Listing>>>,
    /// Any batch containing this external id fails as a whole.
    poison_id: Arc<Mutex<Option<String>>>,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage failure for batches containing `external_id`.
    pub fn fail_batches_with(&self, external_id: &str) {
        *lock(&self.poison_id) = Some(external_id.to_string());
    }

    pub fn stop_failing(&self) {
        *lock(&self.poison_id) = None;
    }

    pub fn len(&self) -> usize {
        lock(&self.listings).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored listings of `source`, active or not.
    pub fn all(&self, source: &str) -> Vec<Listing> {
        lock(&self.listings)
            .values()
            .filter(|l| l.record.source == source)
            .cloned()
            .collect()
    }
}

impl ListingStore for InMemoryListingStore {
    async fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertReport, AppError> {
        if let Some(poison) = lock(&self.poison_id).as_deref()
            && records.iter().any(|r| r.external_id == poison)
        {
            return Err(AppError::TransactionError(format!(
                "batch of {} rolled back: write failed for {poison}",
                records.len()
            )));
        }

        let now = Utc::now();
        let mut listings = lock(&self.listings);
        let mut report = UpsertReport::default();

        for record in records {
            let mut record = record.clone();
            record.active = true;
            let key = record.natural_key();

            match listings.get_mut(&key) {
                Some(existing) if existing.record.differs_from(&record) => {
                    existing.content_hash = record.content_hash();
                    existing.record = record.clone();
                    existing.updated_at = now;
                    existing.last_seen_at = now;
                    report.updated += 1;
                    report.changes.push(ChangeEvent {
                        listing_id: existing.id,
                        kind: ChangeKind::Updated,
                        record,
                    });
                }
                Some(existing) => {
                    existing.record.active = true;
                    existing.last_seen_at = now;
                    report.skipped += 1;
                }
                None => {
                    let listing = Listing {
                        id: Uuid::new_v4(),
                        content_hash: record.content_hash(),
                        record: record.clone(),
                        created_at: now,
                        updated_at: now,
                        last_seen_at: now,
                    };
                    report.inserted += 1;
                    report.changes.push(ChangeEvent {
                        listing_id: listing.id,
                        kind: ChangeKind::Inserted,
                        record,
                    });
                    listings.insert(key, listing);
                }
            }
        }
        Ok(report)
    }

    async fn mark_inactive(&self, source: &str, seen_ids: &[String]) -> Result<u64, AppError> {
        let seen: HashSet<&str> = seen_ids.iter().map(String::as_str).collect();
        let now = Utc::now();
        let mut deactivated = 0;
        for listing in lock(&self.listings).values_mut() {
            if listing.record.source == source
                && listing.record.active
                && !seen.contains(listing.record.external_id.as_str())
            {
                listing.record.active = false;
                listing.updated_at = now;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let mut listings = lock(&self.listings);
        let before = listings.len();
        listings.retain(|_, l| l.record.active || l.last_seen_at >= older_than);
        Ok((before - listings.len()) as u64)
    }

    async fn get(&self, source: &str, external_id: &str) -> Result<Option<Listing>, AppError> {
        let key = NaturalKey {
            source: source.to_string(),
            external_id: external_id.to_string(),
        };
        Ok(lock(&self.listings).get(&key).cloned())
    }

    async fn list_active(&self, source: &str, limit: usize) -> Result<Vec<Listing>, AppError> {
        let mut active: Vec<Listing> = lock(&self.listings)
            .values()
            .filter(|l| l.record.source == source && l.record.active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        active.truncate(limit);
        Ok(active)
    }
}

// ---------------------------------------------------------------------------
// InMemoryLogStore
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct InMemoryLogStore {
    entries: Arc<Mutex<Vec<LogEntry>>>,
    batch_calls: Arc<AtomicUsize>,
}

impl InMemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    /// Number of `insert_batch` calls so far.
    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }
}

impl LogStore for InMemoryLogStore {
    async fn insert_batch(&self, entries: &[LogEntry]) -> Result<u64, AppError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.entries).extend_from_slice(entries);
        Ok(entries.len() as u64)
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>, AppError> {
        let mut matched: Vec<LogEntry> = lock(&self.entries)
            .iter()
            .filter(|e| query.matches(e))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.limit)
            .collect())
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LogStats, AppError> {
        let entries = lock(&self.entries);
        let mut by_level = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        let mut errors = Vec::new();
        for entry in entries.iter().filter(|e| e.timestamp >= since) {
            *by_level.entry(entry.level.to_string()).or_insert(0) += 1;
            *by_source.entry(entry.source.clone()).or_insert(0) += 1;
            if entry.level == LogLevel::Error {
                errors.push(entry.clone());
            }
        }
        errors.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        errors.truncate(RECENT_ERRORS);
        Ok(LogStats {
            by_level,
            by_source,
            recent_errors: errors,
        })
    }
}
