/// SQLite persistence layer for Run Reports
///
/// The engine hands finalized (or in-flight) reports to this sink; they are stored as
/// JSON next to a few indexed columns so runs can be listed per user and fetched by id.

use crate::runtime::report::RunReport;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
    Row,
};
use std::str::FromStr;

/// What a stored run executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunKind {
    /// A full pipeline run
    Workflow,
    /// A stage preview
    Schema,
}

impl RunKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RunKind::Workflow => "WORKFLOW",
            RunKind::Schema => "SCHEMA",
        }
    }
}

impl FromStr for RunKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "WORKFLOW" => Ok(RunKind::Workflow),
            "SCHEMA" => Ok(RunKind::Schema),
            other => Err(anyhow::anyhow!("Unknown run kind: {}", other)),
        }
    }
}

/// A stored run with its full report
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub user_id: String,
    pub kind: RunKind,
    pub report: RunReport,
}

/// Run metadata for listing operations
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub user_id: String,
    pub kind: String,
    pub status: String,
    pub created_at: String,
    pub terminated_at: Option<String>,
    pub message: Option<String>,
    pub result_reference: Option<String>,
}

/// SQLite-based run history
#[derive(Debug, Clone)]
pub struct RunStorage {
    pool: SqlitePool,
}

impl RunStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) the database at `url` and initialize the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        // In-memory databases live per connection
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let storage = Self::new(pool);
        storage.init_schema().await?;
        tracing::info!("🗄️ Run storage ready at {}", url);
        Ok(storage)
    }

    /// Initialize the run storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS).
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                terminated_at TEXT,
                message TEXT,
                result_reference TEXT,
                report JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_runs_user
            ON runs(user_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Store a run or update its status
    pub async fn save_run(&self, user_id: &str, kind: RunKind, report: &RunReport) -> Result<()> {
        let report_json = serde_json::to_string(report)?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, user_id, kind, status, created_at, terminated_at, message, result_reference, report)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                terminated_at = excluded.terminated_at,
                message = excluded.message,
                result_reference = excluded.result_reference,
                report = excluded.report
            "#,
        )
        .bind(report.id())
        .bind(user_id)
        .bind(kind.as_str())
        .bind(report.status().as_str())
        .bind(report.created_at().to_rfc3339())
        .bind(report.terminated_at().map(|t| t.to_rfc3339()))
        .bind(report.message())
        .bind(report.result_reference())
        .bind(&report_json)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Saved run {} ({})", report.id(), report.status());
        Ok(())
    }

    /// Retrieve a run by id
    pub async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT user_id, kind, report FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let report_json: String = row.get("report");
                let kind: String = row.get("kind");
                Ok(Some(RunRecord {
                    user_id: row.get("user_id"),
                    kind: kind.parse()?,
                    report: serde_json::from_str(&report_json)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// List runs, newest first, optionally restricted to one user
    pub async fn list_runs(&self, user_id: Option<&str>) -> Result<Vec<RunSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, status, created_at, terminated_at, message, result_reference
            FROM runs
            WHERE ?1 IS NULL OR user_id = ?1
            ORDER BY created_at DESC, id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(RunSummary {
                id: row.get("id"),
                user_id: row.get("user_id"),
                kind: row.get("kind"),
                status: row.get("status"),
                created_at: row.get("created_at"),
                terminated_at: row.get("terminated_at"),
                message: row.get("message"),
                result_reference: row.get("result_reference"),
            });
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::runtime::report::{RunOutcome, RunStatus};

    async fn storage() -> RunStorage {
        RunStorage::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn save_and_get_run() {
        let storage = storage().await;
        let mut report = RunReport::new();
        storage.save_run("alice", RunKind::Workflow, &report).await.unwrap();

        report.start().unwrap();
        report
            .fail(&PipelineError::Cancelled, RunOutcome::default())
            .unwrap();
        storage.save_run("alice", RunKind::Workflow, &report).await.unwrap();

        let record = storage.get_run(report.id()).await.unwrap().unwrap();
        assert_eq!(record.user_id, "alice");
        assert_eq!(record.kind, RunKind::Workflow);
        assert_eq!(record.report.status(), RunStatus::Error);
        assert_eq!(record.report, report);
        assert!(storage.get_run("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_runs_filters_by_user() {
        let storage = storage().await;
        for user in ["alice", "bob", "alice"] {
            storage.save_run(user, RunKind::Schema, &RunReport::new()).await.unwrap();
        }

        assert_eq!(storage.list_runs(Some("alice")).await.unwrap().len(), 2);
        assert_eq!(storage.list_runs(None).await.unwrap().len(), 3);
        let bob = storage.list_runs(Some("bob")).await.unwrap();
        assert_eq!(bob[0].kind, "SCHEMA");
        assert_eq!(bob[0].status, "PENDING");
    }
}
