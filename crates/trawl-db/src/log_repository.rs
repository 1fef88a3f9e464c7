use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres, QueryBuilder};
use uuid::Uuid;

use trawl_core::error::AppError;
use trawl_core::logsink::{LogEntry, LogLevel, LogQuery, LogStats, RECENT_ERRORS};
use trawl_core::traits::LogStore;

/// Postgres' bind-parameter limit divided by the columns per entry.
const MAX_ROWS_PER_INSERT: usize = 65_535 / 7;

/// Pipeline log persistence in the `pipeline_logs` table.
#[derive(Clone)]
pub struct PgLogStore {
    pool: Pool<Postgres>,
}

impl PgLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct LogRow {
    id: Uuid,
    source: String,
    job_id: Option<Uuid>,
    level: String,
    message: String,
    metadata: serde_json::Value,
    logged_at: DateTime<Utc>,
}

impl From<LogRow> for LogEntry {
    fn from(row: LogRow) -> Self {
        LogEntry {
            id: row.id,
            source: row.source,
            job_id: row.job_id,
            level: row.level.parse().unwrap_or(LogLevel::Info),
            message: row.message,
            metadata: row.metadata,
            timestamp: row.logged_at,
        }
    }
}

fn db_err(e: sqlx::Error) -> AppError {
    AppError::DatabaseError(e.to_string())
}

impl LogStore for PgLogStore {
    async fn insert_batch(&self, entries: &[LogEntry]) -> Result<u64, AppError> {
        let mut written = 0;
        for chunk in entries.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder = QueryBuilder::<Postgres>::new(
                "INSERT INTO pipeline_logs (id, source, job_id, level, message, metadata, logged_at) ",
            );
            builder.push_values(chunk, |mut row, entry| {
                row.push_bind(entry.id)
                    .push_bind(&entry.source)
                    .push_bind(entry.job_id)
                    .push_bind(entry.level.as_str())
                    .push_bind(&entry.message)
                    .push_bind(&entry.metadata)
                    .push_bind(entry.timestamp);
            });
            builder.push(" ON CONFLICT (id) DO NOTHING");

            let result = builder.build().execute(&self.pool).await.map_err(db_err)?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<LogEntry>, AppError> {
        let mut builder = QueryBuilder::<Postgres>::new(
            "SELECT id, source, job_id, level, message, metadata, logged_at FROM pipeline_logs WHERE TRUE",
        );
        if let Some(source) = &query.source {
            builder.push(" AND source = ").push_bind(source);
        }
        if let Some(level) = query.level {
            builder.push(" AND level = ").push_bind(level.as_str());
        }
        if let Some(since) = query.since {
            builder.push(" AND logged_at >= ").push_bind(since);
        }
        if let Some(until) = query.until {
            builder.push(" AND logged_at <= ").push_bind(until);
        }
        builder
            .push(" ORDER BY logged_at DESC LIMIT ")
            .push_bind(query.limit as i64)
            .push(" OFFSET ")
            .push_bind(query.offset as i64);

        let rows = builder
            .build_query_as::<LogRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn stats(&self, since: DateTime<Utc>) -> Result<LogStats, AppError> {
        let by_level: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT level, COUNT(*) FROM pipeline_logs WHERE logged_at >= $1 GROUP BY level"#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let by_source: Vec<(String, i64)> = sqlx::query_as(
            r#"SELECT source, COUNT(*) FROM pipeline_logs WHERE logged_at >= $1 GROUP BY source"#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let recent_errors = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT id, source, job_id, level, message, metadata, logged_at
            FROM pipeline_logs
            WHERE logged_at >= $1 AND level = 'error'
            ORDER BY logged_at DESC
            LIMIT $2
            "#,
        )
        .bind(since)
        .bind(RECENT_ERRORS as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(LogStats {
            by_level: by_level.into_iter().collect::<BTreeMap<_, _>>(),
            by_source: by_source.into_iter().collect::<BTreeMap<_, _>>(),
            recent_errors: recent_errors.into_iter().map(Into::into).collect(),
        })
    }
}
