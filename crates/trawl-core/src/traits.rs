use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{JobStatus, RecordCounts};
use crate::logsink::{LogEntry, LogQuery, LogStats};
use crate::models::{CanonicalRecord, ChangeEvent, Listing, RawRecord, UpsertReport};
use crate::proxy::ProxyEndpoint;

/// Per-session fingerprint presented to a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_agent: String,
    pub viewport: (u32, u32),
}

/// A single page request.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    pub proxy: Option<ProxyEndpoint>,
    pub identity: Option<Identity>,
}

impl FetchRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            identity: None,
        }
    }

    pub fn via(mut self, proxy: Option<ProxyEndpoint>) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn as_identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// Fetches raw HTML content from a URL.
pub trait Fetcher: Send + Sync + Clone {
    fn fetch(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<String, AppError>> + Send;
}

/// Converts raw HTML into clean text.
pub trait Cleaner: Send + Sync + Clone {
    fn clean(&self, html: &str) -> Result<String, AppError>;
}

/// An element on a page that could not be turned into a record.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedElement {
    pub index: usize,
    pub reason: String,
}

/// What one adapter call produced: the records it could extract plus the
/// elements it had to skip. A page with some malformed cards is a partial
/// success, not an error.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<RawRecord>,
    pub skipped: Vec<SkippedElement>,
}

/// Source-specific fetch + extract capability, one implementation per source.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch `url` and extract raw records. Records committed during this
    /// session are not emitted again.
    async fn fetch(&self, url: &str) -> Result<FetchOutcome, AppError>;

    /// Check that an extracted item has the shape this source produces.
    fn validate_shape(&self, data: &serde_json::Value) -> bool;

    /// Remember `ids` for the session. Called once their records are stored.
    fn commit_seen(&self, ids: &[String]);

    /// Forget the session dedup cache. Called before every full sweep.
    fn clear_session(&self);
}

/// Persists canonical listings keyed by (source, external id).
pub trait ListingStore: Send + Sync + Clone {
    /// Insert new, update changed, skip unchanged. All-or-nothing per batch.
    fn upsert(
        &self,
        records: &[CanonicalRecord],
    ) -> impl Future<Output = Result<UpsertReport, AppError>> + Send;

    /// Deactivate every active listing of `source` whose external id is not
    /// in `seen_ids`. Returns the number of listings deactivated.
    fn mark_inactive(
        &self,
        source: &str,
        seen_ids: &[String],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Hard-delete inactive listings last seen before `older_than`.
    fn purge_inactive(
        &self,
        older_than: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get(
        &self,
        source: &str,
        external_id: &str,
    ) -> impl Future<Output = Result<Option<Listing>, AppError>> + Send;

    fn list_active(
        &self,
        source: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Listing>, AppError>> + Send;
}

/// Batch persistence and querying for pipeline log entries.
pub trait LogStore: Send + Sync + Clone + 'static {
    fn insert_batch(
        &self,
        entries: &[LogEntry],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn query(
        &self,
        query: &LogQuery,
    ) -> impl Future<Output = Result<Vec<LogEntry>, AppError>> + Send;

    fn stats(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<LogStats, AppError>> + Send;
}

/// Fields reported alongside a job status transition.
#[derive(Debug, Clone, Default)]
pub struct JobStatusFields {
    pub counts: Option<RecordCounts>,
    pub error: Option<String>,
    pub progress: Option<&'static str>,
}

/// The externally owned job-history record. The pipeline reports state
/// transitions here but does not own the schema.
#[async_trait]
pub trait JobStatusSink: Send + Sync {
    async fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        fields: JobStatusFields,
    ) -> Result<(), AppError>;
}

/// Receives one event per inserted or updated listing.
pub trait ChangeNotifier: Send + Sync {
    fn notify(&self, event: &ChangeEvent);
}

/// A no-op sink for when no job-history collaborator is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStatusSink;

#[async_trait]
impl JobStatusSink for NullStatusSink {
    async fn update_job_status(
        &self,
        _job_id: Uuid,
        _status: JobStatus,
        _fields: JobStatusFields,
    ) -> Result<(), AppError> {
        Ok(())
    }
}

/// Notifier that only logs the change.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl ChangeNotifier for TracingNotifier {
    fn notify(&self, event: &ChangeEvent) {
        tracing::debug!(
            listing_id = %event.listing_id,
            kind = ?event.kind,
            key = %event.record.natural_key(),
            "Listing changed"
        );
    }
}
