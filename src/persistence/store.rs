//! SQLite-based run history

use crate::persistence::{PersistenceBackend, RunSummary};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        pipeline_name TEXT NOT NULL,
        status TEXT NOT NULL,
        failed_stage TEXT,
        failed_action TEXT,
        error TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        progress REAL NOT NULL DEFAULT 0.0,
        completed_stages INTEGER NOT NULL DEFAULT 0,
        total_stages INTEGER NOT NULL DEFAULT 0,
        artifacts TEXT NOT NULL DEFAULT '[]',
        variables TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL DEFAULT (datetime('now'))
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_pipeline_name ON runs(pipeline_name)",
    "CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at)",
];

const COLUMNS: &str = "id, pipeline_name, status, failed_stage, failed_action, error, \
     started_at, finished_at, progress, completed_stages, total_stages, artifacts, variables";

/// SQLite run store
pub struct SqliteRunStore {
    pool: SqlitePool,
}

impl SqliteRunStore {
    /// Open (or create) the database at `db_path`; `:memory:` is accepted
    pub async fn new(db_path: &str) -> Result<Self> {
        let pool = if db_path == ":memory:" {
            // every connection would see its own empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
                .await
        } else {
            SqlitePoolOptions::new()
                .connect_with(
                    SqliteConnectOptions::new()
                        .filename(db_path)
                        .create_if_missing(true),
                )
                .await
        }
        .context("Failed to connect to database")?;

        let store = Self { pool };
        store.init().await?;

        Ok(store)
    }

    /// Default database location
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("release-pipeline")
            .join("runs.db")
    }

    /// Create store with default path
    pub async fn with_default_path() -> Result<Self> {
        Self::at(&Self::default_path()).await
    }

    /// Create store at `path`, creating parent directories
    pub async fn at(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let db_path = path
            .to_str()
            .with_context(|| format!("Database path {} is not UTF-8", path.display()))?;
        Self::new(db_path).await
    }

    /// Initialize database schema
    async fn init(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    fn to_naive(dt: DateTime<Utc>) -> NaiveDateTime {
        dt.naive_utc()
    }

    fn from_naive(dt: NaiveDateTime) -> DateTime<Utc> {
        DateTime::from_naive_utc_and_offset(dt, Utc)
    }

    fn from_row(row: &SqliteRow) -> Result<RunSummary> {
        Ok(RunSummary {
            run_id: Uuid::parse_str(&row.get::<String, _>("id"))?,
            pipeline_name: row.get("pipeline_name"),
            status: row.get::<String, _>("status").parse()?,
            failed_stage: row.get("failed_stage"),
            failed_action: row.get("failed_action"),
            error: row.get("error"),
            started_at: Self::from_naive(row.get("started_at")),
            finished_at: row
                .get::<Option<NaiveDateTime>, _>("finished_at")
                .map(Self::from_naive),
            progress: row.get("progress"),
            completed_stages: row.get::<i64, _>("completed_stages") as usize,
            total_stages: row.get::<i64, _>("total_stages") as usize,
            artifacts: serde_json::from_str(&row.get::<String, _>("artifacts"))
                .context("Corrupt artifact list")?,
            variables: serde_json::from_str(&row.get::<String, _>("variables"))
                .context("Corrupt variable map")?,
        })
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for SqliteRunStore {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
            (id, pipeline_name, status, failed_stage, failed_action, error, started_at,
             finished_at, progress, completed_stages, total_stages, artifacts, variables)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(run.run_id.to_string())
        .bind(&run.pipeline_name)
        .bind(run.status.as_str())
        .bind(&run.failed_stage)
        .bind(&run.failed_action)
        .bind(&run.error)
        .bind(Self::to_naive(run.started_at))
        .bind(run.finished_at.map(Self::to_naive))
        .bind(run.progress)
        .bind(run.completed_stages as i64)
        .bind(run.total_stages as i64)
        .bind(serde_json::to_string(&run.artifacts)?)
        .bind(serde_json::to_string(&run.variables)?)
        .execute(&self.pool)
        .await
        .context("Failed to save run")?;

        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        let row = sqlx::query(&format!("SELECT {} FROM runs WHERE id = ?1", COLUMNS))
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load run")?;

        row.as_ref().map(Self::from_row).transpose()
    }

    async fn list_runs(&self, pipeline_name: &str) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM runs WHERE pipeline_name = ?1 ORDER BY started_at DESC",
            COLUMNS
        ))
        .bind(pipeline_name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list runs")?;

        rows.iter().map(Self::from_row).collect()
    }

    async fn list_pipelines(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT pipeline_name
            FROM runs
            ORDER BY pipeline_name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list pipelines")?;

        Ok(rows.iter().map(|row| row.get("pipeline_name")).collect())
    }
}
