//! Database initialization
//!
//! Creates the database on first run and brings the schema up idempotently.
//! All tables use `CREATE TABLE IF NOT EXISTS` so initialization is safe to
//! call from every service at startup.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pool sized for concurrent batch writers plus lookup readers
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(5)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // Enable foreign keys
    sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;

    // WAL allows concurrent lookup readers while an import batch commits
    sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

    sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

    // Schema creation (idempotent - safe to call multiple times)
    create_duty_rates_table(&pool).await?;
    create_import_runs_table(&pool).await?;
    create_import_provenance_table(&pool).await?;
    create_advisory_locks_table(&pool).await?;

    Ok(pool)
}

/// Create the duty_rates table (the converged domain dataset)
///
/// `(dest, partner, hs6, duty_rule, effective_from)` is the natural key used
/// for conflict resolution. `partner = ''` is the first-class "applies to
/// all partners" value (MFN / erga omnes), never a stand-in for unknown.
pub async fn create_duty_rates_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS duty_rates (
            id TEXT PRIMARY KEY,
            dest TEXT NOT NULL,
            partner TEXT NOT NULL DEFAULT '',
            hs6 TEXT NOT NULL,
            duty_rule TEXT NOT NULL,
            rate_pct TEXT NOT NULL,
            currency TEXT,
            effective_from TEXT NOT NULL,
            effective_to TEXT,
            partner_agnostic INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            source TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            UNIQUE(dest, partner, hs6, duty_rule, effective_from)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_duty_rates_lookup
         ON duty_rates(dest, hs6, effective_from)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the import_runs table (run ledger)
pub async fn create_import_runs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_runs (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            job TEXT NOT NULL,
            params TEXT NOT NULL,
            status TEXT NOT NULL,
            started_at TEXT NOT NULL,
            finished_at TEXT,
            inserted_count INTEGER NOT NULL DEFAULT 0,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the import_provenance table (append-only audit trail)
pub async fn create_import_provenance_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS import_provenance (
            id TEXT PRIMARY KEY,
            import_id TEXT NOT NULL REFERENCES import_runs(id),
            resource_type TEXT NOT NULL,
            resource_id TEXT NOT NULL,
            source_ref TEXT,
            row_hash TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_import_provenance_run
         ON import_provenance(import_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Create the advisory_locks table
///
/// Rows are ephemeral: one per in-flight import, deleted on release and
/// cleared wholesale at service startup to reclaim locks left behind by a
/// crashed holder.
pub async fn create_advisory_locks_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS advisory_locks (
            key_hash INTEGER PRIMARY KEY,
            lock_key TEXT NOT NULL,
            holder TEXT NOT NULL,
            acquired_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_init_creates_schema() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("rates.db");

        let pool = init_database(&db_path).await.expect("init failed");

        // All four tables queryable
        for table in ["duty_rates", "import_runs", "import_provenance", "advisory_locks"] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "table {} should exist and be empty", table);
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("rates.db");

        let pool = init_database(&db_path).await.unwrap();
        drop(pool);

        // Second init on the same file must not fail or clobber
        let pool = init_database(&db_path).await.expect("re-init failed");
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM duty_rates")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
