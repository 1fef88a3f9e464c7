pub mod circuit_breaker;
pub mod config;
pub mod dedup;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod logsink;
pub mod memory;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod pool;
pub mod proxy;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod traits;
pub mod validate;
pub mod worker;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use error::AppError;
pub use job::{CreateJobRequest, IngestJob, JobKind, JobStatus, RecordCounts, WorkerConfig};
pub use job_queue::JobQueue;
pub use models::{CanonicalRecord, Listing, RawRecord, compute_hash};
pub use pipeline::IngestPipeline;
pub use queue::{IngestQueue, QueueHealth};
pub use registry::AdapterRegistry;
pub use traits::{Fetcher, JobStatusSink, ListingStore, LogStore, SourceAdapter};
