/// SqliteWorkDao - WorkDaoトレイトのSQLite実装
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::debug;
use uuid::Uuid;

use super::dao_trait::{WorkDao, WorkMutation};
use super::process::ProcessQueries;
use super::work::WorkQueries;
use crate::store::models::{NewWork, ProcessStatus, Work, WorkFilter};

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS works (
    id BLOB PRIMARY KEY NOT NULL,
    name TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    submitted_at TEXT,
    dataset_fingerprint TEXT UNIQUE,
    status TEXT NOT NULL,
    submission_config TEXT NOT NULL,
    resume_info TEXT NOT NULL,
    undone_job_ids TEXT NOT NULL DEFAULT '[]',
    done_job_ids TEXT NOT NULL DEFAULT '[]',
    pid INTEGER
);

CREATE INDEX IF NOT EXISTS idx_works_status ON works (status);
CREATE INDEX IF NOT EXISTS idx_works_created_at ON works (created_at);

CREATE TABLE IF NOT EXISTS process_status (
    pid INTEGER PRIMARY KEY NOT NULL,
    work_id BLOB NOT NULL REFERENCES works (id) ON DELETE CASCADE,
    description TEXT NOT NULL,
    current INTEGER NOT NULL,
    total INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct SqliteWorkDao {
    pool: SqlitePool,
}

impl SqliteWorkDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens (creating if needed) the database file and applies the schema.
    ///
    /// # Errors
    /// Fails when the file cannot be opened or the schema cannot be applied.
    pub async fn connect(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open work store {}", path.display()))?;

        let dao = Self::new(pool);
        dao.migrate().await?;
        debug!(path = %path.display(), "work store ready");
        Ok(dao)
    }

    /// In-memory store, shared by all connections of the pool.
    ///
    /// # Errors
    /// Fails when SQLite cannot be initialised.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory sqlite url")?
            .foreign_keys(true);

        // A single connection keeps every query on the same in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("failed to open in-memory work store")?;

        let dao = Self::new(pool);
        dao.migrate().await?;
        Ok(dao)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .context("failed to apply work store schema")?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl WorkDao for SqliteWorkDao {
    async fn create_work(&self, new_work: NewWork) -> anyhow::Result<Work> {
        WorkQueries::create(&self.pool, new_work).await
    }

    async fn get_work(&self, id: Uuid) -> anyhow::Result<Option<Work>> {
        WorkQueries::get(&self.pool, id).await
    }

    async fn list_works(&self, filter: &WorkFilter) -> anyhow::Result<Vec<Work>> {
        WorkQueries::list(&self.pool, filter).await
    }

    async fn delete_work(&self, id: Uuid) -> anyhow::Result<Option<Work>> {
        WorkQueries::delete(&self.pool, id).await
    }

    async fn modify_work(&self, id: Uuid, mutation: WorkMutation) -> anyhow::Result<Work> {
        WorkQueries::modify(&self.pool, id, mutation).await
    }

    async fn claim_fingerprint(&self, id: Uuid, fingerprint: &str) -> anyhow::Result<Option<Uuid>> {
        WorkQueries::claim_fingerprint(&self.pool, id, fingerprint).await
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> anyhow::Result<Option<Uuid>> {
        WorkQueries::find_by_fingerprint(&self.pool, fingerprint).await
    }

    async fn upsert_process_status(&self, status: &ProcessStatus) -> anyhow::Result<()> {
        ProcessQueries::upsert(&self.pool, status).await
    }

    async fn delete_process_status(&self, pid: u32) -> anyhow::Result<()> {
        ProcessQueries::delete(&self.pool, pid).await
    }

    async fn list_process_status(&self, work_id: Uuid) -> anyhow::Result<Vec<ProcessStatus>> {
        ProcessQueries::list_for_work(&self.pool, work_id).await
    }
}
