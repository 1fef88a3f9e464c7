//! Buffered pipeline log sink.
//!
//! [`LogSink`] is a cheap cloneable handle. Entries go over a bounded
//! channel to one background task that writes them to a [`LogStore`] in a
//! single batch when `batch_size` entries have accumulated or
//! `flush_interval` has elapsed, whichever comes first. Whatever is
//! buffered is flushed on shutdown. Producers never wait: when the channel
//! is full the entry is dropped and counted.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::traits::LogStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("Unknown log level: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Uuid,
    pub source: String,
    pub job_id: Option<Uuid>,
    pub level: LogLevel,
    pub message: String,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(level: LogLevel, source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source: source.into(),
            job_id: None,
            level,
            message: message.into(),
            metadata: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn for_job(mut self, job_id: Uuid) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Filter for [`LogStore::query`]. Results are newest first.
#[derive(Debug, Clone)]
pub struct LogQuery {
    pub source: Option<String>,
    pub level: Option<LogLevel>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            source: None,
            level: None,
            since: None,
            until: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl LogQuery {
    pub fn matches(&self, entry: &LogEntry) -> bool {
        self.source.as_ref().is_none_or(|s| *s == entry.source)
            && self.level.is_none_or(|l| l == entry.level)
            && self.since.is_none_or(|t| entry.timestamp >= t)
            && self.until.is_none_or(|t| entry.timestamp <= t)
    }
}

/// Aggregates over a time range.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogStats {
    pub by_level: BTreeMap<String, i64>,
    pub by_source: BTreeMap<String, i64>,
    pub recent_errors: Vec<LogEntry>,
}

/// Number of error entries returned in [`LogStats::recent_errors`].
pub const RECENT_ERRORS: usize = 10;

#[derive(Debug, Clone, Copy)]
pub struct LogSinkConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Entries that may wait in the channel before new ones are dropped.
    pub capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            flush_interval: Duration::from_secs(30),
            capacity: 1000,
        }
    }
}

/// Handle for submitting log entries.
#[derive(Debug, Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogSink {
    /// Start the flusher task. It exits after a final flush once `cancel`
    /// fires or every handle has been dropped.
    pub fn spawn<S: LogStore>(
        store: S,
        config: LogSinkConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let handle = tokio::spawn(run_flusher(store, config, rx, cancel));
        (
            Self {
                tx,
                dropped: Arc::default(),
            },
            handle,
        )
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            tx,
            dropped: Arc::default(),
        }
    }

    pub fn log(&self, entry: LogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(
                        dropped,
                        source = %entry.source,
                        "Log sink buffer full, dropping entries"
                    );
                }
            }
            // Flusher is gone; entries are best effort.
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Entries dropped because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn info(&self, source: &str, job_id: Option<Uuid>, message: impl Into<String>) {
        self.emit(LogLevel::Info, source, job_id, message.into());
    }

    pub fn warn(&self, source: &str, job_id: Option<Uuid>, message: impl Into<String>) {
        self.emit(LogLevel::Warn, source, job_id, message.into());
    }

    pub fn error(&self, source: &str, job_id: Option<Uuid>, message: impl Into<String>) {
        self.emit(LogLevel::Error, source, job_id, message.into());
    }

    fn emit(&self, level: LogLevel, source: &str, job_id: Option<Uuid>, message: String) {
        let mut entry = LogEntry::new(level, source, message);
        entry.job_id = job_id;
        self.log(entry);
    }
}

async fn flush<S: LogStore>(store: &S, buffer: &mut Vec<LogEntry>, max_buffer: usize) {
    if buffer.is_empty() {
        return;
    }
    let result = store.insert_batch(&buffer[..]).await;
    match result {
        Ok(written) => {
            tracing::debug!(written, "Flushed log entries");
            buffer.clear();
        }
        Err(e) => {
            tracing::warn!(error = %e, buffered = buffer.len(), "Failed to flush log entries");
            if buffer.len() > max_buffer {
                let excess = buffer.len() - max_buffer;
                buffer.drain(..excess);
                tracing::warn!(dropped = excess, "Dropped oldest log entries");
            }
        }
    }
}

async fn run_flusher<S: LogStore>(
    store: S,
    config: LogSinkConfig,
    mut rx: mpsc::Receiver<LogEntry>,
    cancel: CancellationToken,
) {
    let batch_size = config.batch_size.max(1);
    let max_buffer = batch_size * 10;
    let mut buffer = Vec::with_capacity(batch_size);
    let start = tokio::time::Instant::now() + config.flush_interval;
    let mut ticker = tokio::time::interval_at(start, config.flush_interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(entry) => {
                    buffer.push(entry);
                    if buffer.len() >= batch_size {
                        flush(&store, &mut buffer, max_buffer).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => flush(&store, &mut buffer, max_buffer).await,
        }
    }

    while let Ok(entry) = rx.try_recv() {
        buffer.push(entry);
    }
    flush(&store, &mut buffer, max_buffer).await;
    tracing::debug!("Log sink stopped");
}
