//! Import run ledger operations
//!
//! Every logical import gets exactly one row here, created `running` and
//! moved to exactly one terminal status. Terminal rows are never reopened.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// Lifecycle status of an import run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => anyhow::bail!("unknown run status: {}", other),
        }
    }
}

/// One import attempt, durable audit record
#[derive(Debug, Clone)]
pub struct ImportRun {
    pub id: Uuid,
    pub source: String,
    pub job: String,
    pub params: serde_json::Value,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub inserted_count: i64,
    pub error: Option<String>,
}

/// Create a new run record in `running` state
pub async fn create_run(
    pool: &SqlitePool,
    source: &str,
    job: &str,
    params: &serde_json::Value,
) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO import_runs (id, source, job, params, status, started_at)
        VALUES (?, ?, ?, ?, 'running', ?)
        "#,
    )
    .bind(id.to_string())
    .bind(source)
    .bind(job)
    .bind(params.to_string())
    .bind(Utc::now().to_rfc3339())
    .execute(pool)
    .await?;

    Ok(id)
}

/// Terminal transition to `succeeded`. The status guard keeps a terminal
/// run from ever being reopened or re-finished.
pub async fn mark_succeeded(pool: &SqlitePool, run_id: Uuid, inserted_count: i64) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_runs
        SET status = 'succeeded', finished_at = ?, inserted_count = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(inserted_count)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Terminal transition to `failed` with a human-readable error string
pub async fn mark_failed(pool: &SqlitePool, run_id: Uuid, error: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE import_runs
        SET status = 'failed', finished_at = ?, error = ?
        WHERE id = ? AND status = 'running'
        "#,
    )
    .bind(Utc::now().to_rfc3339())
    .bind(error)
    .bind(run_id.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load one run by id
pub async fn load_run(pool: &SqlitePool, run_id: Uuid) -> Result<Option<ImportRun>> {
    let row = sqlx::query(
        r#"
        SELECT id, source, job, params, status, started_at, finished_at, inserted_count, error
        FROM import_runs
        WHERE id = ?
        "#,
    )
    .bind(run_id.to_string())
    .fetch_optional(pool)
    .await?;

    match row {
        Some(row) => {
            let id_str: String = row.get("id");
            let params_str: String = row.get("params");
            let status_str: String = row.get("status");
            let started_str: String = row.get("started_at");
            let finished_str: Option<String> = row.get("finished_at");

            Ok(Some(ImportRun {
                id: Uuid::parse_str(&id_str)?,
                source: row.get("source"),
                job: row.get("job"),
                params: serde_json::from_str(&params_str)?,
                status: RunStatus::parse(&status_str)?,
                started_at: DateTime::parse_from_rfc3339(&started_str)?.with_timezone(&Utc),
                finished_at: finished_str
                    .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
                    .transpose()?,
                inserted_count: row.get("inserted_count"),
                error: row.get("error"),
            }))
        }
        None => Ok(None),
    }
}

/// Count all run records
pub async fn count_runs(pool: &SqlitePool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_runs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}
