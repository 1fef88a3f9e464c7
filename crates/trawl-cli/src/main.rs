mod sources;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use trawl_client::HttpProxyProber;
use trawl_core::config::PipelineConfig;
use trawl_core::dedup::similar_pairs;
use trawl_core::logsink::{LogLevel, LogQuery, LogSink, LogSinkConfig};
use trawl_core::pool::WorkerPool;
use trawl_core::proxy::ProxyPool;
use trawl_core::scheduler::RecurringScheduler;
use trawl_core::traits::{ListingStore, LogStore, TracingNotifier};
use trawl_core::worker::TracingWorkerReporter;
use trawl_core::{CreateJobRequest, IngestPipeline, IngestQueue, JobKind};
use trawl_db::{Database, DatabaseConfig, PgJobQueue};

use crate::sources::SourcesFile;

#[derive(Parser)]
#[command(name = "trawl", version, about = "Listing ingestion pipeline")]
struct Cli {
    /// Path to the sources file
    #[arg(long, global = true, env = "TRAWL_SOURCES", default_value = "sources.json")]
    sources: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool and recurring schedules until Ctrl+C
    Worker,

    /// Queue one ingestion job
    Enqueue {
        /// Source name as declared in the sources file
        #[arg(short, long)]
        source: String,

        /// Listing page or search URL
        #[arg(short, long)]
        url: String,

        /// full_scrape, incremental or single_page
        #[arg(short, long, default_value = "incremental")]
        kind: String,

        /// Higher runs sooner
        #[arg(short, long, default_value_t = 0)]
        priority: i32,

        /// Seconds before the job becomes eligible
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Stop dispatching queued jobs (running jobs finish)
    Pause,

    /// Resume dispatching
    Resume,

    /// Move every failed job back to pending
    RetryFailed,

    /// Show queue counts and the pause flag
    Health,

    /// Show pipeline log entries, newest first
    Logs {
        #[arg(short, long)]
        source: Option<String>,

        /// debug, info, warn or error
        #[arg(long)]
        level: Option<String>,

        /// Only entries from the last N hours
        #[arg(long)]
        since_hours: Option<i64>,

        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        #[arg(long, default_value_t = 0)]
        offset: usize,
    },

    /// Aggregate log counts by level and source
    LogStats {
        #[arg(long, default_value_t = 24)]
        hours: i64,
    },

    /// Report near-duplicate active listings of one source
    Duplicates {
        #[arg(short, long)]
        source: String,

        #[arg(long, default_value_t = 0.8)]
        min_score: f64,

        /// How many active listings to compare
        #[arg(short, long, default_value_t = 1000)]
        limit: usize,
    },

    /// Delete finished jobs and inactive listings older than N days
    Purge {
        #[arg(short, long, default_value_t = 30)]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker => cmd_worker(&cli.sources).await?,
        Commands::Enqueue {
            source,
            url,
            kind,
            priority,
            delay,
        } => {
            let sources = SourcesFile::load(&cli.sources)?;
            let db = connect_db().await?;
            let queue = IngestQueue::for_sources(db.job_queue(), sources.names());

            let mut request = CreateJobRequest::new(source, url, kind.parse::<JobKind>()?)
                .with_priority(priority);
            if let Some(secs) = delay {
                request = request.with_delay(Duration::from_secs(secs));
            }
            let id = queue.enqueue(request).await?;
            println!("{id}");
        }
        Commands::Pause => {
            operator_queue().await?.pause().await?;
            println!("Queue paused");
        }
        Commands::Resume => {
            operator_queue().await?.resume().await?;
            println!("Queue resumed");
        }
        Commands::RetryFailed => {
            let n = operator_queue().await?.retry_failed().await?;
            println!("Requeued {n} failed jobs");
        }
        Commands::Health => {
            let health = operator_queue().await?.health().await?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Logs {
            source,
            level,
            since_hours,
            limit,
            offset,
        } => {
            let level = level
                .map(|l| l.parse::<LogLevel>())
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let query = LogQuery {
                source,
                level,
                since: since_hours.map(|h| Utc::now() - TimeDelta::hours(h)),
                until: None,
                limit,
                offset,
            };
            cmd_logs(&query).await?;
        }
        Commands::LogStats { hours } => {
            let db = connect_db().await?;
            let stats = db
                .log_store()
                .stats(Utc::now() - TimeDelta::hours(hours))
                .await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Duplicates {
            source,
            min_score,
            limit,
        } => cmd_duplicates(&source, min_score, limit).await?,
        Commands::Purge { days } => {
            let db = connect_db().await?;
            let cutoff = Utc::now() - TimeDelta::days(days);
            let jobs = IngestQueue::for_sources(db.job_queue(), [])
                .purge(cutoff)
                .await?;
            let listings = db.listing_store().purge_inactive(cutoff).await?;
            println!("Purged {jobs} finished jobs and {listings} inactive listings");
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using the `DATABASE_*` variables and migrate.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env()?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await?;
    Ok(db)
}

/// Queue handle for commands that never enqueue.
async fn operator_queue() -> Result<IngestQueue<PgJobQueue>> {
    let db = connect_db().await?;
    Ok(IngestQueue::for_sources(db.job_queue(), []))
}

async fn cmd_worker(sources_path: &Path) -> Result<()> {
    let config = PipelineConfig::from_env()?;
    let sources = SourcesFile::load(sources_path)
        .with_context(|| format!("Failed to load {}", sources_path.display()))?;
    let db = connect_db().await?;
    let cancel = CancellationToken::new();

    let proxies = ProxyPool::new(config.proxies.clone());
    let proxy_checks = (!proxies.is_empty()).then(|| {
        proxies.spawn_health_checks(
            HttpProxyProber::new(&config.proxy_check_url, config.fetch_timeout),
            config.proxy_check_interval,
            cancel.clone(),
        )
    });

    let registry = sources
        .build_registry(&config, &proxies, |key| std::env::var(key).ok())
        .await?;

    // The flusher outlives the workers so their last entries are written.
    let flush_cancel = CancellationToken::new();
    let (log_sink, log_flusher) =
        LogSink::spawn(db.log_store(), LogSinkConfig::default(), flush_cancel.clone());
    let pipeline = Arc::new(
        IngestPipeline::new(registry.clone(), db.listing_store())
            .with_notifier(Arc::new(TracingNotifier))
            .with_log_sink(log_sink),
    );

    let job_queue = db.job_queue().with_max_retries(config.max_attempts);
    let queue = IngestQueue::new(job_queue.clone(), &registry)
        .with_scheduler(RecurringScheduler::with_parent(&cancel));
    for recurring in sources.recurring() {
        queue.enqueue_recurring(&recurring.name, recurring.template, &recurring.cron)?;
    }

    let pool = WorkerPool::new(
        job_queue,
        pipeline,
        Arc::new(db.status_sink()),
        config.worker_config(),
    )
    .start(cancel.clone(), Arc::new(TracingWorkerReporter));

    tracing::info!(
        workers = pool.size(),
        sources = registry.len(),
        schedules = queue.scheduler().names().len(),
        proxies = proxies.len(),
        "Worker running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install CTRL+C handler")?;
    tracing::info!("Shutdown signal received, waiting for in-flight jobs");

    cancel.cancel();
    pool.wait_for_shutdown().await;
    queue.scheduler().shutdown();
    flush_cancel.cancel();
    if let Err(e) = log_flusher.await {
        tracing::warn!(error = %e, "Log flusher task panicked");
    }
    if let Some(handle) = proxy_checks {
        let _ = handle.await;
    }

    tracing::info!("Worker stopped");
    Ok(())
}

async fn cmd_logs(query: &LogQuery) -> Result<()> {
    let db = connect_db().await?;
    let entries = db.log_store().query(query).await?;

    if entries.is_empty() {
        println!("No log entries found");
        return Ok(());
    }

    for entry in &entries {
        let job = entry
            .job_id
            .map(|id| format!(" job={}", &id.to_string()[..8]))
            .unwrap_or_default();
        println!(
            "{} {:<5} [{}]{} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.level.as_str().to_uppercase(),
            entry.source,
            job,
            entry.message,
        );
    }
    Ok(())
}

async fn cmd_duplicates(source: &str, min_score: f64, limit: usize) -> Result<()> {
    let db = connect_db().await?;
    let listings = db.listing_store().list_active(source, limit).await?;
    let records: Vec<_> = listings.into_iter().map(|l| l.record).collect();
    let titles: HashMap<&str, &str> = records
        .iter()
        .map(|r| (r.external_id.as_str(), r.title.as_str()))
        .collect();

    let pairs = similar_pairs(&records, min_score);
    if pairs.is_empty() {
        println!(
            "No pairs at or above {min_score:.2} among {} active listings of {source}",
            records.len()
        );
        return Ok(());
    }

    for pair in &pairs {
        println!(
            "  {:.3}  {} \"{}\"  ~  {} \"{}\"",
            pair.score,
            pair.first,
            titles.get(pair.first.as_str()).unwrap_or(&""),
            pair.second,
            titles.get(pair.second.as_str()).unwrap_or(&""),
        );
    }
    println!("\nTotal: {} pairs", pairs.len());
    Ok(())
}
