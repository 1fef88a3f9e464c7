pub mod config;
pub mod database;
pub mod job_repository;
pub mod listing_repository;
pub mod log_repository;
pub mod status_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::PgJobQueue;
pub use listing_repository::PgListingStore;
pub use log_repository::PgLogStore;
pub use status_repository::PgJobStatusSink;
