//! Test utilities: fixtures and mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls. Enabled for downstream crates with
//! the `testutil` feature.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{
    CreateJobRequest, IngestJob, JobCounts, JobKind, JobStatus, RecordCounts, RetryConfig,
};
use crate::job_queue::JobQueue;
use crate::models::{CanonicalRecord, ChangeEvent, RawRecord, WorkMode};
use crate::pipeline::{Stage, StageObserver};
use crate::traits::{
    ChangeNotifier, FetchOutcome, FetchRequest, Fetcher, JobStatusFields, JobStatusSink,
    SourceAdapter,
};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// A valid canonical record from source `test-board`.
pub fn make_record(external_id: &str, title: &str) -> CanonicalRecord {
    CanonicalRecord {
        title: title.to_string(),
        organization: "Acme Labs".to_string(),
        description: "Work on real projects with a small team.".to_string(),
        location: "Remote".to_string(),
        compensation: Some(15_000),
        duration_months: Some(3),
        work_mode: WorkMode::Remote,
        skills: vec!["Rust".to_string(), "SQL".to_string()],
        application_url: format!("https://test-board.example.com/jobs/{external_id}"),
        source: "test-board".to_string(),
        external_id: external_id.to_string(),
        posted_date: NaiveDate::from_ymd_opt(2026, 3, 1),
        deadline: NaiveDate::from_ymd_opt(2026, 4, 30),
        active: true,
    }
}

/// A raw record shaped like the HTML extractor's output.
pub fn raw_listing(source: &str, external_id: &str, title: &str) -> RawRecord {
    RawRecord::new(source, Some(external_id.to_string()))
        .with_field("title", title)
        .with_field("company", "Acme Labs")
        .with_field("description", "Work on real projects with a small team.")
        .with_field("location", "Work From Home")
        .with_field("stipend", "₹ 10,000 /month")
        .with_field("duration", "3 Months")
        .with_field("skills", serde_json::json!(["rust", "sql"]))
        .with_field(
            "apply_url",
            format!("https://{source}.example.com/jobs/{external_id}"),
        )
}

/// A freshly claimed job.
pub fn make_test_job(source: &str, kind: JobKind) -> IngestJob {
    let now = Utc::now();
    IngestJob {
        id: Uuid::new_v4(),
        seq: 1,
        source: source.to_string(),
        url: format!("https://{source}.example.com/listings"),
        kind,
        priority: 0,
        metadata: serde_json::json!({}),
        status: JobStatus::Running,
        created_at: now,
        updated_at: now,
        run_at: now,
        started_at: Some(now),
        completed_at: None,
        retry_count: 0,
        max_retries: RetryConfig::default().max_retries,
        counts: RecordCounts::default(),
        error_message: None,
        worker_id: Some("test-worker".to_string()),
    }
}

// ---------------------------------------------------------------------------
// MockFetcher
// ---------------------------------------------------------------------------

/// Mock fetcher that returns queued responses and records every request.
#[derive(Clone)]
pub struct MockFetcher {
    /// Each call pops the first element. If empty, returns a default page.
    responses: Arc<Mutex<Vec<Result<String, AppError>>>>,
    pub requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockFetcher {
    pub fn new(html: &str) -> Self {
        Self::with_responses(vec![Ok(html.to_string())])
    }

    pub fn with_error(error: AppError) -> Self {
        Self::with_responses(vec![Err(error)])
    }

    pub fn with_responses(responses: Vec<Result<String, AppError>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<String, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            Ok("<html><body></body></html>".to_string())
        } else {
            responses.remove(0)
        }
    }
}

// ---------------------------------------------------------------------------
// MockAdapter
// ---------------------------------------------------------------------------

/// Source adapter returning a fixed record set (or an error) on every fetch.
#[derive(Clone)]
pub struct MockAdapter {
    name: String,
    records: Arc<Mutex<Vec<RawRecord>>>,
    error: Arc<Mutex<Option<AppError>>>,
    fetches: Arc<AtomicUsize>,
    clears: Arc<AtomicUsize>,
    committed: Arc<Mutex<Vec<String>>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Arc::new(Mutex::new(Vec::new())),
            error: Arc::new(Mutex::new(None)),
            fetches: Arc::new(AtomicUsize::new(0)),
            clears: Arc::new(AtomicUsize::new(0)),
            committed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_records(self, records: Vec<RawRecord>) -> Self {
        self.set_records(records);
        self
    }

    /// Fail every fetch with a copy of `error`.
    pub fn with_error(self, error: AppError) -> Self {
        *self.error.lock().unwrap() = Some(error);
        self
    }

    pub fn set_records(&self, records: Vec<RawRecord>) {
        *self.records.lock().unwrap() = records;
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn clear_calls(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    /// Ids handed to `commit_seen`, in order.
    pub fn committed(&self) -> Vec<String> {
        self.committed.lock().unwrap().clone()
    }
}

fn copy_error(error: &AppError) -> AppError {
    match error {
        AppError::HttpError(m) => AppError::HttpError(m.clone()),
        AppError::NetworkError(m) => AppError::NetworkError(m.clone()),
        AppError::Timeout(s) => AppError::Timeout(*s),
        AppError::RateLimitExceeded => AppError::RateLimitExceeded,
        AppError::AuthError(m) => AppError::AuthError(m.clone()),
        AppError::QuotaExceeded(m) => AppError::QuotaExceeded(m.clone()),
        AppError::ProxyError(m) => AppError::ProxyError(m.clone()),
        AppError::ExtractionError(m) => AppError::ExtractionError(m.clone()),
        AppError::ValidationError(m) => AppError::ValidationError(m.clone()),
        AppError::UnknownSource(m) => AppError::UnknownSource(m.clone()),
        AppError::JobConflict(m) => AppError::JobConflict(m.clone()),
        AppError::TransactionError(m) => AppError::TransactionError(m.clone()),
        AppError::DatabaseError(m) => AppError::DatabaseError(m.clone()),
        AppError::ConfigError(m) => AppError::ConfigError(m.clone()),
        other => AppError::Generic(other.to_string()),
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, _url: &str) -> Result<FetchOutcome, AppError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.error.lock().unwrap().as_ref() {
            return Err(copy_error(error));
        }
        Ok(FetchOutcome {
            records: self.records.lock().unwrap().clone(),
            skipped: Vec::new(),
        })
    }

    fn validate_shape(&self, data: &serde_json::Value) -> bool {
        data.is_object()
    }

    fn commit_seen(&self, ids: &[String]) {
        self.committed.lock().unwrap().extend_from_slice(ids);
    }

    fn clear_session(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
        self.committed.lock().unwrap().clear();
    }
}

// ---------------------------------------------------------------------------
// MockJobQueue
// ---------------------------------------------------------------------------

/// Recorded failure: (job_id, error_message, next_retry_at, counts).
pub type FailedJobRecord = (Uuid, String, Option<DateTime<Utc>>, RecordCounts);

/// Recorded completion: (job_id, counts).
pub type CompletedJobRecord = (Uuid, RecordCounts);

/// Mock job queue that hands out pre-loaded jobs and records outcomes.
#[derive(Clone)]
pub struct MockJobQueue {
    jobs: Arc<Mutex<Vec<IngestJob>>>,
    claim_error: Arc<Mutex<Option<AppError>>>,
    pub failed_jobs: Arc<Mutex<Vec<FailedJobRecord>>>,
    pub completed_jobs: Arc<Mutex<Vec<CompletedJobRecord>>>,
    pub released_workers: Arc<Mutex<Vec<String>>>,
    pub stall_sweeps: Arc<AtomicUsize>,
}

impl MockJobQueue {
    pub fn empty() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(Vec::new())),
            claim_error: Arc::new(Mutex::new(None)),
            failed_jobs: Arc::new(Mutex::new(Vec::new())),
            completed_jobs: Arc::new(Mutex::new(Vec::new())),
            released_workers: Arc::new(Mutex::new(Vec::new())),
            stall_sweeps: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue with one job ready to be claimed.
    pub fn with_job(job: IngestJob) -> Self {
        let queue = Self::empty();
        queue.jobs.lock().unwrap().push(job);
        queue
    }

    pub fn with_claim_error(error: AppError) -> Self {
        let queue = Self::empty();
        *queue.claim_error.lock().unwrap() = Some(error);
        queue
    }
}

impl JobQueue for MockJobQueue {
    async fn create_job(&self, request: CreateJobRequest) -> Result<IngestJob, AppError> {
        let now = Utc::now();
        let mut job = make_test_job(&request.source, request.kind);
        job.url = request.url;
        job.priority = request.priority;
        job.metadata = request.metadata;
        job.status = JobStatus::Pending;
        job.started_at = None;
        job.worker_id = None;
        job.run_at = now;
        self.jobs.lock().unwrap().push(job.clone());
        Ok(job)
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<IngestJob>, AppError> {
        if let Some(e) = self.claim_error.lock().unwrap().take() {
            return Err(e);
        }
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.is_empty() {
            return Ok(None);
        }
        let mut job = jobs.remove(0);
        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        Ok(Some(job))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        _worker_id: &str,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        self.completed_jobs.lock().unwrap().push((job_id, counts));
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        _worker_id: &str,
        error: &str,
        next_retry_at: Option<DateTime<Utc>>,
        counts: RecordCounts,
    ) -> Result<(), AppError> {
        self.failed_jobs
            .lock()
            .unwrap()
            .push((job_id, error.to_string(), next_retry_at, counts));
        Ok(())
    }

    async fn cancel_job(&self, _job_id: Uuid) -> Result<(), AppError> {
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<IngestJob>, AppError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|j| j.id == job_id)
            .cloned())
    }

    async fn list_jobs(
        &self,
        _status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<IngestJob>, AppError> {
        Ok(self.jobs.lock().unwrap().iter().take(limit).cloned().collect())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        self.released_workers
            .lock()
            .unwrap()
            .push(worker_id.to_string());
        Ok(0)
    }

    async fn requeue_stalled(&self, _stall_timeout: std::time::Duration) -> Result<u64, AppError> {
        self.stall_sweeps.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }

    async fn retry_failed(&self) -> Result<u64, AppError> {
        Ok(0)
    }

    async fn pause(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn resume(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn is_paused(&self) -> Result<bool, AppError> {
        Ok(false)
    }

    async fn counts(&self) -> Result<JobCounts, AppError> {
        Ok(JobCounts {
            waiting: self.jobs.lock().unwrap().len() as i64,
            completed: self.completed_jobs.lock().unwrap().len() as i64,
            failed: self.failed_jobs.lock().unwrap().len() as i64,
            ..Default::default()
        })
    }

    async fn purge_finished(&self, _older_than: DateTime<Utc>) -> Result<u64, AppError> {
        Ok(0)
    }
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Worker reporter that records job failures' `will_retry` flags.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    failures: Arc<Mutex<Vec<bool>>>,
    completions: Arc<AtomicUsize>,
}

impl RecordingReporter {
    pub fn failures(&self) -> Vec<bool> {
        self.failures.lock().unwrap().clone()
    }

    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }
}

impl WorkerReporter for RecordingReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::JobFailed { will_retry, .. } => {
                self.failures.lock().unwrap().push(will_retry);
            }
            WorkerEvent::JobCompleted { .. } => {
                self.completions.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

/// Recorded status update: (job_id, status, progress label).
pub type StatusUpdate = (Uuid, JobStatus, Option<&'static str>);

/// Job-history sink that keeps every update.
#[derive(Clone, Default)]
pub struct RecordingStatusSink {
    pub updates: Arc<Mutex<Vec<StatusUpdate>>>,
}

impl RecordingStatusSink {
    pub fn last_status(&self, job_id: Uuid) -> Option<JobStatus> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, _)| *id == job_id)
            .map(|(_, status, _)| *status)
    }

    pub fn progress(&self, job_id: Uuid) -> Vec<&'static str> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| *id == job_id)
            .filter_map(|(_, _, progress)| *progress)
            .collect()
    }
}

#[async_trait]
impl JobStatusSink for RecordingStatusSink {
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: JobStatusFields,
    ) -> Result<(), AppError> {
        self.updates
            .lock()
            .unwrap()
            .push((job_id, status, fields.progress));
        Ok(())
    }
}

/// Pipeline observer that records stage labels in order.
#[derive(Clone, Default)]
pub struct RecordingStages {
    stages: Arc<Mutex<Vec<Stage>>>,
}

impl RecordingStages {
    pub fn labels(&self) -> Vec<&'static str> {
        self.stages.lock().unwrap().iter().map(Stage::label).collect()
    }
}

impl StageObserver for RecordingStages {
    async fn stage(&self, _job: &IngestJob, stage: Stage) {
        self.stages.lock().unwrap().push(stage);
    }
}

/// Change notifier that keeps every event.
#[derive(Clone, Default)]
pub struct RecordingNotifier {
    events: Arc<Mutex<Vec<ChangeEvent>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn notify(&self, event: &ChangeEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
