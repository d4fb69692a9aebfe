//! Import provenance ledger
//!
//! Append-only: one record per materially-changed domain row per run,
//! linking the stored fact to the import and source citation that produced
//! it. Never mutated or deleted here (retention pruning is external).

use anyhow::Result;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// One provenance entry
#[derive(Debug, Clone)]
pub struct ProvenanceRecord {
    pub id: Uuid,
    pub import_id: Uuid,
    pub resource_type: String,
    pub resource_id: String,
    pub source_ref: Option<String>,
    pub row_hash: String,
}

/// Append one provenance record. Takes a connection so the write joins the
/// caller's batch transaction (and rolls back with it on dry runs).
pub async fn record(
    conn: &mut SqliteConnection,
    import_id: Uuid,
    resource_type: &str,
    resource_id: &str,
    source_ref: Option<&str>,
    row_hash: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO import_provenance (id, import_id, resource_type, resource_id, source_ref, row_hash)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(import_id.to_string())
    .bind(resource_type)
    .bind(resource_id)
    .bind(source_ref)
    .bind(row_hash)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Load all provenance rows written by one run
pub async fn list_for_run(pool: &SqlitePool, import_id: Uuid) -> Result<Vec<ProvenanceRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT id, import_id, resource_type, resource_id, source_ref, row_hash
        FROM import_provenance
        WHERE import_id = ?
        ORDER BY created_at
        "#,
    )
    .bind(import_id.to_string())
    .fetch_all(pool)
    .await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let id_str: String = row.get("id");
        let import_id_str: String = row.get("import_id");
        records.push(ProvenanceRecord {
            id: Uuid::parse_str(&id_str)?,
            import_id: Uuid::parse_str(&import_id_str)?,
            resource_type: row.get("resource_type"),
            resource_id: row.get("resource_id"),
            source_ref: row.get("source_ref"),
            row_hash: row.get("row_hash"),
        });
    }

    Ok(records)
}

/// Count provenance rows written by one run
pub async fn count_for_run(pool: &SqlitePool, import_id: Uuid) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM import_provenance WHERE import_id = ?")
            .bind(import_id.to_string())
            .fetch_one(pool)
            .await?;
    Ok(count)
}
