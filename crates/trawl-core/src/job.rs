use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Status of an ingestion job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// What a job is expected to cover.
///
/// Only a `FullScrape` observes every live listing of a source, so it is the
/// only kind allowed to retire listings that were not seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    FullScrape,
    Incremental,
    SinglePage,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::FullScrape => "full_scrape",
            JobKind::Incremental => "incremental",
            JobKind::SinglePage => "single_page",
        }
    }

    pub fn is_full_sweep(&self) -> bool {
        matches!(self, JobKind::FullScrape)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "full_scrape" => Ok(JobKind::FullScrape),
            "incremental" => Ok(JobKind::Incremental),
            "single_page" => Ok(JobKind::SinglePage),
            _ => Err(AppError::ValidationError(format!("Unknown job kind: {s}"))),
        }
    }
}

/// Retry configuration with exponential backoff: `base_delay * 2^attempt`,
/// capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: TimeDelta::seconds(5),
            max_delay: TimeDelta::minutes(10),
        }
    }
}

impl RetryConfig {
    /// Delay before the retry that follows `attempt` previous failures
    /// (0-indexed: the first retry uses `attempt = 0`).
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        let factor = 2i32.checked_pow(attempt).unwrap_or(i32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Record counters accumulated while a job runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCounts {
    pub processed: u32,
    pub added: u32,
    pub updated: u32,
    pub failed: u32,
}

/// An ingestion job in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    pub id: Uuid,
    /// Monotonic enqueue sequence, the FIFO tie-break within a priority.
    pub seq: i64,
    pub source: String,
    pub url: String,
    pub kind: JobKind,
    pub priority: i32,
    pub metadata: serde_json::Value,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not eligible for dispatch before this instant (delay or retry backoff).
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub counts: RecordCounts,
    pub error_message: Option<String>,
    pub worker_id: Option<String>,
}

impl IngestJob {
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn calculate_next_retry(&self, config: &RetryConfig) -> DateTime<Utc> {
        Utc::now() + config.delay_for_attempt(self.retry_count)
    }
}

/// Request to create a new ingestion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
    pub source: String,
    pub url: String,
    pub kind: JobKind,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, with = "optional_secs")]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub max_retries: Option<u32>,
}

impl CreateJobRequest {
    pub fn new(source: impl Into<String>, url: impl Into<String>, kind: JobKind) -> Self {
        Self {
            source: source.into(),
            url: url.into(),
            kind,
            priority: 0,
            delay: None,
            metadata: serde_json::Value::Object(Default::default()),
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }

    /// First instant at which the job may be dispatched.
    pub fn run_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self.delay.and_then(|d| TimeDelta::from_std(d).ok()) {
            Some(delay) => now + delay,
            None => now,
        }
    }
}

mod optional_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

/// Job counts by queue state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    /// Pending and eligible now.
    pub waiting: i64,
    /// Pending but held back by a delay or retry backoff.
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// A running job older than this is assumed orphaned and requeued.
    pub stall_timeout: Duration,
    pub retry_config: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            concurrency: 3,
            poll_interval: Duration::from_secs(5),
            stall_timeout: Duration::from_secs(30 * 60),
            retry_config: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry_config = retry;
        self
    }
}
