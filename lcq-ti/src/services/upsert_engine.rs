//! Streaming duty-rate upsert engine
//!
//! Consumes candidate rows incrementally (never materializing the whole
//! feed), writes in one transaction per batch, resolves natural-key
//! conflicts by source precedence, and records one provenance row per
//! materially-changed record. Re-running the same feed is a true no-op:
//! identical content writes nothing and counts nothing.

use crate::db::{provenance, retry};
use crate::error::ImportError;
use crate::types::CandidateRow;
use futures::{Stream, StreamExt};
use lcq_common::db::models::{canonical_rate_hash, RateSource};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum total time to retry a lock-contended batch commit
const BATCH_LOCK_WAIT_MS: u64 = 5000;

/// Callback deriving a provenance citation from a row
pub type SourceRefFn = Arc<dyn Fn(&CandidateRow) -> Option<String> + Send + Sync>;

/// Upsert tuning and provenance wiring
#[derive(Clone, Default)]
pub struct UpsertOptions {
    /// Rows per transaction; 0 is treated as 1
    pub batch_size: usize,
    /// Run to attribute provenance to; None skips provenance entirely
    pub import_id: Option<Uuid>,
    /// Force every row's source tag (e.g. cross-checked rows become `llm`)
    pub source_override: Option<RateSource>,
    /// Run the full read/compare logic but roll back every batch
    pub dry_run: bool,
    /// Caller-supplied citation; falls back to the row's own source_url
    pub source_ref: Option<SourceRefFn>,
}

impl std::fmt::Debug for UpsertOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpsertOptions")
            .field("batch_size", &self.batch_size)
            .field("import_id", &self.import_id)
            .field("source_override", &self.source_override)
            .field("dry_run", &self.dry_run)
            .field("source_ref", &self.source_ref.as_ref().map(|_| "fn"))
            .finish()
    }
}

/// Tallies of one upsert pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Rows newly created
    pub inserted: u64,
    /// Rows materially changed (no-ops excluded)
    pub updated: u64,
    /// Rows consumed from the input
    pub count: u64,
    pub dry_run: bool,
}

/// What the engine did with one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowDisposition {
    Inserted,
    Updated,
    /// Identical content already stored
    Unchanged,
    /// Stored row has higher source precedence
    Skipped,
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchOutcome {
    inserted: u64,
    updated: u64,
}

/// Upsert a stream of candidate rows in batched transactions.
pub async fn upsert_stream<S>(
    pool: &SqlitePool,
    rows: S,
    opts: &UpsertOptions,
) -> Result<UpsertSummary, ImportError>
where
    S: Stream<Item = anyhow::Result<CandidateRow>>,
{
    futures::pin_mut!(rows);

    let batch_size = opts.batch_size.max(1);
    let mut summary = UpsertSummary {
        dry_run: opts.dry_run,
        ..Default::default()
    };
    let mut batch: Vec<CandidateRow> = Vec::with_capacity(batch_size);

    while let Some(row) = rows.next().await {
        let mut row = row.map_err(ImportError::Other)?;
        row.validate().map_err(ImportError::InvalidRow)?;
        if let Some(source) = opts.source_override {
            row.source = source;
        }
        batch.push(row);

        if batch.len() >= batch_size {
            flush_batch(pool, &mut batch, opts, &mut summary).await?;
        }
    }
    if !batch.is_empty() {
        flush_batch(pool, &mut batch, opts, &mut summary).await?;
    }

    tracing::info!(
        inserted = summary.inserted,
        updated = summary.updated,
        count = summary.count,
        dry_run = summary.dry_run,
        "Upsert pass complete"
    );
    Ok(summary)
}

/// Convenience wrapper for fully-materialized row sets
pub async fn upsert_rows(
    pool: &SqlitePool,
    rows: Vec<CandidateRow>,
    opts: &UpsertOptions,
) -> Result<UpsertSummary, ImportError> {
    let stream = futures::stream::iter(rows.into_iter().map(Ok::<CandidateRow, anyhow::Error>));
    upsert_stream(pool, stream, opts).await
}

async fn flush_batch(
    pool: &SqlitePool,
    batch: &mut Vec<CandidateRow>,
    opts: &UpsertOptions,
    summary: &mut UpsertSummary,
) -> Result<(), ImportError> {
    let rows: &[CandidateRow] = batch;
    let outcome = retry::retry_on_lock("duty-rate batch upsert", BATCH_LOCK_WAIT_MS, || {
        apply_batch(pool, rows, opts)
    })
    .await
    .map_err(ImportError::Other)?;

    summary.inserted += outcome.inserted;
    summary.updated += outcome.updated;
    summary.count += batch.len() as u64;
    batch.clear();
    Ok(())
}

/// Apply one batch inside a single transaction. Dry runs execute the same
/// read/compare/write path and then roll the transaction back.
async fn apply_batch(
    pool: &SqlitePool,
    batch: &[CandidateRow],
    opts: &UpsertOptions,
) -> anyhow::Result<BatchOutcome> {
    let mut tx = pool.begin().await?;
    let mut outcome = BatchOutcome::default();

    for row in batch {
        match upsert_row(&mut tx, row, opts).await? {
            RowDisposition::Inserted => outcome.inserted += 1,
            RowDisposition::Updated => outcome.updated += 1,
            RowDisposition::Unchanged | RowDisposition::Skipped => {}
        }
    }

    if opts.dry_run {
        tx.rollback().await?;
    } else {
        tx.commit().await?;
    }
    Ok(outcome)
}

async fn upsert_row(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    row: &CandidateRow,
    opts: &UpsertOptions,
) -> anyhow::Result<RowDisposition> {
    let effective_from = row.effective_from.to_string();

    let existing = sqlx::query(
        "SELECT id, rate_pct, currency, effective_to, partner_agnostic, notes, source
         FROM duty_rates
         WHERE dest = ? AND partner = ? AND hs6 = ? AND duty_rule = ? AND effective_from = ?",
    )
    .bind(&row.dest)
    .bind(row.partner.as_db_str())
    .bind(&row.hs6)
    .bind(row.duty_rule.as_str())
    .bind(&effective_from)
    .fetch_optional(&mut **tx)
    .await?;

    let incoming_hash = row.content_hash();
    let effective_to = row.effective_to.map(|d| d.to_string());

    let Some(stored) = existing else {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO duty_rates
                (id, dest, partner, hs6, duty_rule, rate_pct, currency,
                 effective_from, effective_to, partner_agnostic, notes, source)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&row.dest)
        .bind(row.partner.as_db_str())
        .bind(&row.hs6)
        .bind(row.duty_rule.as_str())
        .bind(&row.rate_pct)
        .bind(&row.currency)
        .bind(&effective_from)
        .bind(&effective_to)
        .bind(row.partner_agnostic as i64)
        .bind(&row.notes)
        .bind(row.source.as_str())
        .execute(&mut **tx)
        .await?;

        write_provenance(tx, opts, row, id, &incoming_hash).await?;
        return Ok(RowDisposition::Inserted);
    };

    let stored_id_str: String = stored.get("id");
    let stored_id = Uuid::parse_str(&stored_id_str)?;
    let stored_source_str: String = stored.get("source");
    let stored_source = RateSource::from_str(&stored_source_str)?;

    // Conflict resolution: overwrite only when the incoming source ranks at
    // least as high as the stored one. Equal precedence overwrites so a
    // newer refresh from the same authority lands.
    if row.source.precedence() < stored_source.precedence() {
        tracing::debug!(
            key = %row.natural_key(),
            stored = %stored_source,
            incoming = %row.source,
            "Keeping higher-precedence stored row"
        );
        return Ok(RowDisposition::Skipped);
    }

    let stored_rate: String = stored.get("rate_pct");
    let stored_currency: Option<String> = stored.get("currency");
    let stored_effective_to: Option<String> = stored.get("effective_to");
    let stored_partner_agnostic: i64 = stored.get("partner_agnostic");
    let stored_notes: Option<String> = stored.get("notes");

    let stored_hash = canonical_rate_hash(
        &row.dest,
        row.partner.as_db_str(),
        &row.hs6,
        row.duty_rule.as_str(),
        &stored_rate,
        stored_currency.as_deref(),
        &effective_from,
        stored_effective_to.as_deref(),
        stored_partner_agnostic != 0,
        stored_notes.as_deref(),
        stored_source.as_str(),
    );

    if stored_hash == incoming_hash {
        return Ok(RowDisposition::Unchanged);
    }

    sqlx::query(
        r#"
        UPDATE duty_rates
        SET rate_pct = ?, currency = ?, effective_to = ?, partner_agnostic = ?,
            notes = ?, source = ?, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?
        "#,
    )
    .bind(&row.rate_pct)
    .bind(&row.currency)
    .bind(&effective_to)
    .bind(row.partner_agnostic as i64)
    .bind(&row.notes)
    .bind(row.source.as_str())
    .bind(stored_id.to_string())
    .execute(&mut **tx)
    .await?;

    write_provenance(tx, opts, row, stored_id, &incoming_hash).await?;
    Ok(RowDisposition::Updated)
}

async fn write_provenance(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    opts: &UpsertOptions,
    row: &CandidateRow,
    rate_id: Uuid,
    row_hash: &str,
) -> anyhow::Result<()> {
    let Some(import_id) = opts.import_id else {
        return Ok(());
    };
    let source_ref = opts
        .source_ref
        .as_ref()
        .and_then(|make_ref| make_ref(row))
        .or_else(|| row.source_url.clone());

    provenance::record(
        &mut **tx,
        import_id,
        "duty_rate",
        &rate_id.to_string(),
        source_ref.as_deref(),
        row_hash,
    )
    .await
}
