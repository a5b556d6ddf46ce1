use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, MutexGuard};

use crate::config::DatabaseConfig;
use crate::error::Result;

/// Database connection pool wrapper
///
/// Every mutation of the blob and metadata tables runs while holding the
/// write gate, so reference-count read-modify-write cycles never interleave.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    write_gate: Arc<Mutex<()>>,
}

impl Database {
    /// Create a new database connection
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Create database URL
        let url = format!("sqlite:{}?mode=rwc", config.path);

        let options = SqliteConnectOptions::from_str(&url)?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs))
            .foreign_keys(true);

        // Create connection pool
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        Ok(Self {
            pool,
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the store-wide write gate
    pub async fn write_gate(&self) -> MutexGuard<'_, ()> {
        self.write_gate.lock().await
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blobs (
                hash TEXT PRIMARY KEY,
                size INTEGER NOT NULL,
                ref_count INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS package_files (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                file_name TEXT UNIQUE NOT NULL,
                kind TEXT NOT NULL,
                size INTEGER NOT NULL,
                environment TEXT NOT NULL,
                uploaded_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachment_meta (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                package_id TEXT NOT NULL,
                sub_container_id TEXT NOT NULL,
                local_element_id TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT NOT NULL DEFAULT '',
                content_type TEXT NOT NULL,
                hash TEXT NOT NULL,
                package_file TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (package_id, sub_container_id, local_element_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachment_meta_package_id ON attachment_meta(package_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachment_meta_hash ON attachment_meta(hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachment_meta_package_file ON attachment_meta(package_file)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_blobs_ref_count ON blobs(ref_count)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}
