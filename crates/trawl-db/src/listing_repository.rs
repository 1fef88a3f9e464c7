use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgConnection, PgPool, Pool, Postgres};
use uuid::Uuid;

use trawl_core::error::AppError;
use trawl_core::models::{CanonicalRecord, ChangeEvent, ChangeKind, Listing, UpsertReport};
use trawl_core::traits::ListingStore;

/// Listing persistence keyed by the (source, external_id) unique constraint.
#[derive(Clone)]
pub struct PgListingStore {
    pool: Pool<Postgres>,
}

impl PgListingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ListingRow {
    id: Uuid,
    source: String,
    external_id: String,
    title: String,
    organization: String,
    description: String,
    location: String,
    compensation: Option<i64>,
    duration_months: Option<i32>,
    work_mode: String,
    skills: Vec<String>,
    application_url: String,
    posted_date: Option<NaiveDate>,
    deadline: Option<NaiveDate>,
    active: bool,
    content_hash: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            record: CanonicalRecord {
                title: row.title,
                organization: row.organization,
                description: row.description,
                location: row.location,
                compensation: row.compensation,
                duration_months: row.duration_months,
                work_mode: row.work_mode.parse().unwrap_or_default(),
                skills: row.skills,
                application_url: row.application_url,
                source: row.source,
                external_id: row.external_id,
                posted_date: row.posted_date,
                deadline: row.deadline,
                active: row.active,
            },
            content_hash: row.content_hash,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

enum Outcome {
    Inserted(Uuid),
    Updated(Uuid),
    Unchanged,
}

async fn lock_existing(
    conn: &mut PgConnection,
    record: &CanonicalRecord,
) -> Result<Option<Listing>, sqlx::Error> {
    let row = sqlx::query_as::<_, ListingRow>(
        r#"
        SELECT * FROM listings
        WHERE source = $1 AND external_id = $2
        FOR UPDATE
        "#,
    )
    .bind(&record.source)
    .bind(&record.external_id)
    .fetch_optional(conn)
    .await?;

    Ok(row.map(Into::into))
}

/// Insert, update, or touch one record inside the caller's transaction.
async fn upsert_one(
    conn: &mut PgConnection,
    record: &CanonicalRecord,
) -> Result<Outcome, sqlx::Error> {
    let mut existing = lock_existing(conn, record).await?;

    if existing.is_none() {
        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO listings (
                source, external_id, title, organization, description, location,
                compensation, duration_months, work_mode, skills, application_url,
                posted_date, deadline, active, content_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, TRUE, $14)
            ON CONFLICT (source, external_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&record.source)
        .bind(&record.external_id)
        .bind(&record.title)
        .bind(&record.organization)
        .bind(&record.description)
        .bind(&record.location)
        .bind(record.compensation)
        .bind(record.duration_months)
        .bind(record.work_mode.as_str())
        .bind(&record.skills)
        .bind(&record.application_url)
        .bind(record.posted_date)
        .bind(record.deadline)
        .bind(record.content_hash())
        .fetch_optional(&mut *conn)
        .await?;

        if let Some((id,)) = inserted {
            return Ok(Outcome::Inserted(id));
        }
        // Another writer inserted the same key since our lookup.
        existing = lock_existing(conn, record).await?;
    }

    let Some(current) = existing else {
        return Err(sqlx::Error::RowNotFound);
    };

    if current.record.differs_from(record) {
        sqlx::query(
            r#"
            UPDATE listings
            SET title = $2, organization = $3, description = $4, location = $5,
                compensation = $6, duration_months = $7, work_mode = $8, skills = $9,
                application_url = $10, posted_date = $11, deadline = $12,
                content_hash = $13, active = TRUE,
                updated_at = NOW(), last_seen_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(current.id)
        .bind(&record.title)
        .bind(&record.organization)
        .bind(&record.description)
        .bind(&record.location)
        .bind(record.compensation)
        .bind(record.duration_months)
        .bind(record.work_mode.as_str())
        .bind(&record.skills)
        .bind(&record.application_url)
        .bind(record.posted_date)
        .bind(record.deadline)
        .bind(record.content_hash())
        .execute(&mut *conn)
        .await?;
        Ok(Outcome::Updated(current.id))
    } else {
        sqlx::query(r#"UPDATE listings SET active = TRUE, last_seen_at = NOW() WHERE id = $1"#)
            .bind(current.id)
            .execute(&mut *conn)
            .await?;
        Ok(Outcome::Unchanged)
    }
}

impl ListingStore for PgListingStore {
    async fn upsert(&self, records: &[CanonicalRecord]) -> Result<UpsertReport, AppError> {
        let rollback = |e: sqlx::Error| {
            AppError::TransactionError(format!("batch of {} rolled back: {e}", records.len()))
        };

        let mut tx = self.pool.begin().await.map_err(rollback)?;
        let mut report = UpsertReport::default();

        for record in records {
            let mut record = record.clone();
            record.active = true;
            // Dropping `tx` on the error path rolls the whole batch back.
            match upsert_one(&mut tx, &record).await.map_err(rollback)? {
                Outcome::Inserted(listing_id) => {
                    report.inserted += 1;
                    report.changes.push(ChangeEvent {
                        listing_id,
                        kind: ChangeKind::Inserted,
                        record,
                    });
                }
                Outcome::Updated(listing_id) => {
                    report.updated += 1;
                    report.changes.push(ChangeEvent {
                        listing_id,
                        kind: ChangeKind::Updated,
                        record,
                    });
                }
                Outcome::Unchanged => report.skipped += 1,
            }
        }

        tx.commit().await.map_err(rollback)?;
        tracing::debug!(
            inserted = report.inserted,
            updated = report.updated,
            skipped = report.skipped,
            "Listing batch committed"
        );
        Ok(report)
    }

    async fn mark_inactive(&self, source: &str, seen_ids: &[String]) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE listings
            SET active = FALSE, updated_at = NOW()
            WHERE source = $1 AND active AND NOT (external_id = ANY($2))
            "#,
        )
        .bind(source)
        .bind(seen_ids)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn purge_inactive(&self, older_than: DateTime<Utc>) -> Result<u64, AppError> {
        let result =
            sqlx::query(r#"DELETE FROM listings WHERE NOT active AND last_seen_at < $1"#)
                .bind(older_than)
                .execute(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get(&self, source: &str, external_id: &str) -> Result<Option<Listing>, AppError> {
        let row = sqlx::query_as::<_, ListingRow>(
            r#"SELECT * FROM listings WHERE source = $1 AND external_id = $2"#,
        )
        .bind(source)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list_active(&self, source: &str, limit: usize) -> Result<Vec<Listing>, AppError> {
        let rows = sqlx::query_as::<_, ListingRow>(
            r#"
            SELECT * FROM listings
            WHERE source = $1 AND active
            ORDER BY updated_at DESC
            LIMIT $2
            "#,
        )
        .bind(source)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
