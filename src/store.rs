//! Dedup/persistence gateway backed by SQLite.
//!
//! The `articles` table is keyed by the normalized article URL. Uniqueness is
//! enforced by the database (`INSERT ... ON CONFLICT(url) DO NOTHING`), never by an
//! in-process lock, so concurrent workers and overlapping runs can persist the
//! same article and exactly one row survives.
//!
//! | Outcome | Meaning |
//! |---------|---------|
//! | `Inserted` | new row written |
//! | `DuplicateIgnored` | a row with that URL already existed |
//! | `StorageError` | anything else; never swallowed |

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::models::{ArticleRecord, PersistResult};
use crate::pipeline::RunReport;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS articles (
        url TEXT PRIMARY KEY,
        title TEXT NOT NULL CHECK (title <> ''),
        publication_date TIMESTAMP NULL,
        summary TEXT NULL,
        source_site TEXT NOT NULL,
        extracted_at TIMESTAMP NOT NULL,
        run_id TEXT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_articles_source_site ON articles(source_site)",
    "CREATE INDEX IF NOT EXISTS idx_articles_publication_date ON articles(publication_date)",
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        run_id TEXT PRIMARY KEY,
        started_at TIMESTAMP NOT NULL,
        finished_at TIMESTAMP NULL,
        report TEXT NOT NULL DEFAULT '{}'
    )
    "#,
];

/// Article store. Cheap to share behind an `Arc`; the pool does the locking.
#[derive(Debug, Clone)]
pub struct ArticleStore {
    pool: SqlitePool,
}

impl ArticleStore {
    /// Open (creating if needed) the database at `database_url`, e.g.
    /// `sqlite://news.db` or `sqlite::memory:`.
    #[instrument(level = "info")]
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let lost = |e: sqlx::Error| StorageError::ConnectionLost(e.to_string());
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(lost)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(10));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(lost)?;
        info!("Connected to article store");
        Ok(Self { pool })
    }

    /// Private in-memory database. Every connection of a pool would otherwise see
    /// its own empty database, so the pool holds exactly one connection for good.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionLost(e.to_string()))?;
        Ok(Self { pool })
    }

    /// Create tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        debug!("Schema ready");
        Ok(())
    }

    /// Conditionally insert one record.
    pub async fn persist(&self, record: &ArticleRecord, run_id: Option<&str>) -> PersistResult {
        let result = sqlx::query(
            r#"
            INSERT INTO articles (url, title, publication_date, summary, source_site, extracted_at, run_id)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(&record.url)
        .bind(&record.title)
        .bind(record.publication_date)
        .bind(&record.summary)
        .bind(&record.source_site)
        .bind(record.extracted_at)
        .bind(run_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => PersistResult::Inserted,
            Ok(_) => PersistResult::DuplicateIgnored,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => PersistResult::DuplicateIgnored,
            Err(e) => {
                let err = StorageError::from(e);
                warn!(url = %record.url, error = %err, "Persist failed");
                PersistResult::StorageError(err)
            }
        }
    }

    /// Whether a record with this normalized URL is already stored. A pre-filter
    /// only: `persist` stays correct if the answer is stale.
    pub async fn exists(&self, url: &str) -> Result<bool, StorageError> {
        let hit: Option<i64> = sqlx::query_scalar("SELECT 1 FROM articles WHERE url = ? LIMIT 1")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        Ok(hit.is_some())
    }

    pub async fn count(&self) -> Result<i64, StorageError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    /// Log a finished (or aborted) run in `pipeline_runs`.
    pub async fn record_run(&self, report: &RunReport) -> Result<(), StorageError> {
        let json = serde_json::to_string(report).map_err(|e| StorageError::Query(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, started_at, finished_at, report)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET finished_at = excluded.finished_at, report = excluded.report
            "#,
        )
        .bind(&report.run_id)
        .bind(report.started_at)
        .bind(report.finished_at)
        .bind(json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
