use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use super::{SnapshotLock, SnapshotStore};
use crate::error::PipelineError;
use crate::models::snapshot::{Snapshot, SnapshotRow};

/// Advisory lock id shared by every writer of the snapshot tables.
const SNAPSHOT_LOCK_KEY: i64 = 0x696d_7061_6374;

const SELECT_ROWS: &str = "SELECT dedup_key, title, company, location, posted_at,
        description_snippet, url, source_site, fetched_at
 FROM listing_snapshot";

pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn load(conn: &mut PgConnection) -> Result<Snapshot, PipelineError> {
    let rows = sqlx::query_as::<_, SnapshotRow>(SELECT_ROWS)
        .fetch_all(&mut *conn)
        .await?;
    let last_run_at: Option<(DateTime<Utc>,)> =
        sqlx::query_as("SELECT last_run_at FROM snapshot_meta WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    Snapshot::from_rows(rows, last_run_at.map(|(at,)| at))
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    /// The read, the diff and the write share one transaction that holds a
    /// transaction-scoped advisory lock; rollback or commit releases it.
    async fn open(&self) -> Result<(Box<dyn SnapshotLock>, Snapshot), PipelineError> {
        let mut tx = self.pool.begin().await?;

        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_xact_lock($1)")
            .bind(SNAPSHOT_LOCK_KEY)
            .fetch_one(&mut *tx)
            .await?;
        if !locked {
            return Err(PipelineError::SnapshotBusy);
        }

        let prior = load(&mut tx).await?;
        Ok((Box::new(PgLock { tx }), prior))
    }

    async fn read(&self) -> Result<Snapshot, PipelineError> {
        let mut conn = self.pool.acquire().await?;
        load(&mut conn).await
    }
}

struct PgLock {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl SnapshotLock for PgLock {
    async fn write(self: Box<Self>, snapshot: &Snapshot) -> Result<(), PipelineError> {
        let mut tx = self.tx;

        sqlx::query("DELETE FROM listing_snapshot")
            .execute(&mut *tx)
            .await?;

        for row in snapshot.rows() {
            sqlx::query(
                "INSERT INTO listing_snapshot
                    (dedup_key, title, company, location, posted_at,
                     description_snippet, url, source_site, fetched_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&row.dedup_key)
            .bind(&row.title)
            .bind(&row.company)
            .bind(&row.location)
            .bind(row.posted_at)
            .bind(&row.description_snippet)
            .bind(&row.url)
            .bind(&row.source_site)
            .bind(row.fetched_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(last_run_at) = snapshot.last_run_at {
            sqlx::query(
                "INSERT INTO snapshot_meta (id, last_run_at) VALUES (1, $1)
                 ON CONFLICT (id) DO UPDATE SET last_run_at = EXCLUDED.last_run_at",
            )
            .bind(last_run_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), PipelineError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::db;
    use crate::models::listing::{JobListing, SourceSite};

    async fn store() -> PgSnapshotStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = db::create_pool(&url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        PgSnapshotStore::new(pool)
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn write_then_read_and_lock_contention() {
        let store = store().await;
        let listing = JobListing {
            title: "ESG Analyst".to_string(),
            company: "Acme".to_string(),
            location: "Hong Kong".to_string(),
            posted_at: None,
            description_snippet: String::new(),
            url: "https://jobs.example/pg".to_string(),
            source_site: SourceSite::JobsDbHk,
            fetched_at: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        };
        let snapshot =
            Snapshot::from_listings(vec![listing], Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap());

        let (lock, _) = store.open().await.unwrap();
        assert!(matches!(store.open().await, Err(PipelineError::SnapshotBusy)));
        lock.write(&snapshot).await.unwrap();

        assert_eq!(store.read().await.unwrap(), snapshot);
    }
}
