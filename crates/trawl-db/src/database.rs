use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use trawl_core::AppError;

use crate::config::DatabaseConfig;
use crate::job_repository::PgJobQueue;
use crate::listing_repository::PgListingStore;
use crate::log_repository::PgLogStore;
use crate::status_repository::PgJobStatusSink;

/// Central database facade: owns the connection pool, runs migrations,
/// and vends the Postgres implementations of the pipeline's stores.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, AppError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Failed to connect: {e}")))?;

        tracing::debug!(max_connections = config.max_connections, "Database pool ready");
        Ok(Self { pool })
    }

    /// Create a `Database` from an existing pool (useful for testing).
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<(), AppError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    pub fn job_queue(&self) -> PgJobQueue {
        PgJobQueue::new(self.pool.clone())
    }

    pub fn listing_store(&self) -> PgListingStore {
        PgListingStore::new(self.pool.clone())
    }

    pub fn log_store(&self) -> PgLogStore {
        PgLogStore::new(self.pool.clone())
    }

    pub fn status_sink(&self) -> PgJobStatusSink {
        PgJobStatusSink::new(self.pool.clone())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
