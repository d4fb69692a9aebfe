//! Duty-rate read path
//!
//! `resolve_active_rate` picks the single applicable rate for a shipment
//! using a strict narrow-to-broad fallback chain. Read-only: it runs
//! concurrently with in-progress imports and tolerates partially-imported
//! data (imports are additive/corrective, not atomic across the dataset).

use crate::db::models::{DutyRate, DutyRule, Partner, RateSource};
use crate::{Error, Result};
use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use std::str::FromStr;
use uuid::Uuid;

/// Outcome class of a rate lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateStatus {
    /// A single applicable rate was found
    Matched,
    /// Data exists for (dest, hs6) but nothing applies on the query date
    NoMatch,
    /// Nothing has been imported for (dest, hs6) at all
    NoDataset,
}

impl RateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RateStatus::Matched => "matched",
            RateStatus::NoMatch => "no_match",
            RateStatus::NoDataset => "no_dataset",
        }
    }
}

/// Result of a rate lookup, with enough metadata to tell "no applicable
/// rate" apart from "no data imported yet"
#[derive(Debug, Clone)]
pub struct RateResolution {
    pub value: Option<DutyRate>,
    pub status: RateStatus,
    pub note: Option<String>,
    pub dataset: Option<String>,
}

/// Pure fallback-eligibility predicate: a row may stand in for a requested
/// partner iff its own partner is global or matches the request exactly.
/// Keeps an FTA row for the wrong partner from masquerading as applicable.
pub fn is_partner_compatible_fallback_row(row_partner: &Partner, requested: Option<&str>) -> bool {
    match row_partner {
        Partner::Global => true,
        Partner::Code(code) => requested.map_or(false, |r| r == code),
    }
}

const RATE_COLUMNS: &str = "id, dest, partner, hs6, duty_rule, rate_pct, currency, \
     effective_from, effective_to, partner_agnostic, notes, source";

/// Resolve the single active rate for a shipment.
///
/// Fallback chain, each step short-circuiting on >= 1 row:
/// 1. Exact partner FTA match (only when a partner was requested)
/// 2. Partner-agnostic global rows (structured flag, global sentinel only)
/// 3. Any still-active row for (dest, hs6), MFN preferred, newest first
/// 4. Metadata probe distinguishing no-match from no-dataset
pub async fn resolve_active_rate(
    pool: &SqlitePool,
    dest: &str,
    hs6: &str,
    on_date: NaiveDate,
    partner: Option<&str>,
) -> Result<RateResolution> {
    let d = on_date.to_string();

    // Step 1: exact partner FTA match
    if let Some(p) = partner.filter(|p| !p.is_empty()) {
        let row = sqlx::query(&format!(
            "SELECT {RATE_COLUMNS} FROM duty_rates
             WHERE dest = ? AND hs6 = ? AND partner = ? AND duty_rule = 'fta'
               AND effective_from <= ? AND (effective_to IS NULL OR effective_to >= ?)
             ORDER BY effective_from DESC
             LIMIT 1"
        ))
        .bind(dest)
        .bind(hs6)
        .bind(p)
        .bind(&d)
        .bind(&d)
        .fetch_optional(pool)
        .await?;

        if let Some(row) = row {
            let rate = rate_from_row(&row)?;
            return Ok(RateResolution {
                dataset: Some(rate.source.to_string()),
                value: Some(rate),
                status: RateStatus::Matched,
                note: Some("exact partner match".to_string()),
            });
        }
    }

    // Step 2: partner-agnostic fallback. The flag alone is not enough - the
    // row must also pass the compatibility predicate, so a flagged row
    // carrying a different partner code never leaks into the wrong quote.
    let rows = sqlx::query(&format!(
        "SELECT {RATE_COLUMNS} FROM duty_rates
         WHERE dest = ? AND hs6 = ? AND partner_agnostic = 1
           AND effective_from <= ? AND (effective_to IS NULL OR effective_to >= ?)
         ORDER BY effective_from DESC"
    ))
    .bind(dest)
    .bind(hs6)
    .bind(&d)
    .bind(&d)
    .fetch_all(pool)
    .await?;

    for row in &rows {
        let rate = rate_from_row(row)?;
        if is_partner_compatible_fallback_row(&rate.partner, partner) {
            return Ok(RateResolution {
                dataset: Some(rate.source.to_string()),
                value: Some(rate),
                status: RateStatus::Matched,
                note: Some("partner-agnostic fallback".to_string()),
            });
        }
    }

    // Step 3: general fallback, MFN preferred, newest effective_from first.
    // Mismatched-partner FTA rows are excluded by the same predicate
    // expressed in SQL: only global rows or rows for the requested partner.
    let row = sqlx::query(&format!(
        "SELECT {RATE_COLUMNS} FROM duty_rates
         WHERE dest = ? AND hs6 = ? AND (partner = '' OR partner = ?)
           AND effective_from <= ? AND (effective_to IS NULL OR effective_to >= ?)
         ORDER BY CASE WHEN duty_rule = 'mfn' THEN 0 ELSE 1 END, effective_from DESC
         LIMIT 1"
    ))
    .bind(dest)
    .bind(hs6)
    .bind(partner.unwrap_or(""))
    .bind(&d)
    .bind(&d)
    .fetch_optional(pool)
    .await?;

    if let Some(row) = row {
        let rate = rate_from_row(&row)?;
        return Ok(RateResolution {
            dataset: Some(rate.source.to_string()),
            value: Some(rate),
            status: RateStatus::Matched,
            note: Some("general fallback".to_string()),
        });
    }

    // Step 4: metadata probe - does any dataset exist for (dest, hs6)?
    let probe = sqlx::query(
        "SELECT source, MIN(effective_from) AS window_from,
                MAX(COALESCE(effective_to, '9999-12-31')) AS window_to,
                COUNT(*) AS n
         FROM duty_rates WHERE dest = ? AND hs6 = ?",
    )
    .bind(dest)
    .bind(hs6)
    .fetch_one(pool)
    .await?;

    let n: i64 = probe.get("n");
    if n > 0 {
        let source: String = probe.get("source");
        let window_from: String = probe.get("window_from");
        let window_to: String = probe.get("window_to");
        Ok(RateResolution {
            value: None,
            status: RateStatus::NoMatch,
            note: Some(format!(
                "no rate active on {}; dataset covers {} to {}",
                d, window_from, window_to
            )),
            dataset: Some(source),
        })
    } else {
        Ok(RateResolution {
            value: None,
            status: RateStatus::NoDataset,
            note: Some(format!("no data imported for {} {}", dest, hs6)),
            dataset: None,
        })
    }
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|e| Error::Internal(format!("malformed date '{}' in duty_rates: {}", s, e)))
}

/// Map one duty_rates row to the domain model
pub fn rate_from_row(row: &SqliteRow) -> Result<DutyRate> {
    let id_str: String = row.get("id");
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| Error::Internal(format!("malformed id in duty_rates: {}", e)))?;

    let partner_str: String = row.get("partner");
    let duty_rule_str: String = row.get("duty_rule");
    let source_str: String = row.get("source");
    let effective_from_str: String = row.get("effective_from");
    let effective_to_str: Option<String> = row.get("effective_to");
    let partner_agnostic: i64 = row.get("partner_agnostic");

    Ok(DutyRate {
        id,
        dest: row.get("dest"),
        partner: Partner::from_db_str(&partner_str),
        hs6: row.get("hs6"),
        duty_rule: DutyRule::from_str(&duty_rule_str)?,
        rate_pct: row.get("rate_pct"),
        currency: row.get("currency"),
        effective_from: parse_date(&effective_from_str)?,
        effective_to: effective_to_str.as_deref().map(parse_date).transpose()?,
        partner_agnostic: partner_agnostic != 0,
        notes: row.get("notes"),
        source: RateSource::from_str(&source_str)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        // Single connection so the in-memory database is shared
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        crate::db::init::create_duty_rates_table(&pool).await.unwrap();
        pool
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_rate(
        pool: &SqlitePool,
        dest: &str,
        partner: &str,
        hs6: &str,
        duty_rule: &str,
        rate_pct: &str,
        effective_from: &str,
        effective_to: Option<&str>,
        partner_agnostic: bool,
        source: &str,
    ) {
        sqlx::query(
            "INSERT INTO duty_rates
             (id, dest, partner, hs6, duty_rule, rate_pct, effective_from, effective_to,
              partner_agnostic, source)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(dest)
        .bind(partner)
        .bind(hs6)
        .bind(duty_rule)
        .bind(rate_pct)
        .bind(effective_from)
        .bind(effective_to)
        .bind(partner_agnostic as i64)
        .bind(source)
        .execute(pool)
        .await
        .unwrap();
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[tokio::test]
    async fn exact_partner_fta_match_wins() {
        let pool = test_pool().await;
        insert_rate(&pool, "US", "", "010121", "mfn", "16.500", "2024-01-01", None, false, "official").await;
        insert_rate(&pool, "US", "MX", "010121", "fta", "0.000", "2024-01-01", None, false, "official").await;

        let res = resolve_active_rate(&pool, "US", "010121", date("2024-06-01"), Some("MX"))
            .await
            .unwrap();
        assert_eq!(res.status, RateStatus::Matched);
        let rate = res.value.unwrap();
        assert_eq!(rate.duty_rule, DutyRule::Fta);
        assert_eq!(rate.rate_pct, "0.000");
    }

    #[tokio::test]
    async fn mismatched_partner_falls_back_to_mfn() {
        // Only an MX-partner FTA row and a global MFN row exist; a CN query
        // must get the MFN row, never the mismatched FTA row.
        let pool = test_pool().await;
        insert_rate(&pool, "US", "MX", "010121", "fta", "0.000", "2024-01-01", None, false, "official").await;
        insert_rate(&pool, "US", "", "010121", "mfn", "16.500", "2024-01-01", None, false, "official").await;

        let res = resolve_active_rate(&pool, "US", "010121", date("2024-06-01"), Some("CN"))
            .await
            .unwrap();
        assert_eq!(res.status, RateStatus::Matched);
        let rate = res.value.unwrap();
        assert_eq!(rate.duty_rule, DutyRule::Mfn);
        assert_eq!(rate.rate_pct, "16.500");
    }

    #[tokio::test]
    async fn partner_agnostic_fallback_requires_global_sentinel() {
        let pool = test_pool().await;
        // Flagged but carrying a mismatched partner code: never eligible
        insert_rate(&pool, "US", "MX", "010121", "fta", "0.000", "2024-01-01", None, true, "official").await;
        // Flagged global row: eligible for any partner
        insert_rate(&pool, "US", "", "010121", "safeguard", "5.000", "2024-02-01", None, true, "official").await;

        let res = resolve_active_rate(&pool, "US", "010121", date("2024-06-01"), Some("CN"))
            .await
            .unwrap();
        let rate = res.value.unwrap();
        assert!(rate.partner.is_global());
        assert_eq!(rate.rate_pct, "5.000");
        assert_eq!(res.note.as_deref(), Some("partner-agnostic fallback"));
    }

    #[tokio::test]
    async fn general_fallback_prefers_mfn_and_newest() {
        let pool = test_pool().await;
        insert_rate(&pool, "US", "", "010121", "safeguard", "25.000", "2024-03-01", None, false, "official").await;
        insert_rate(&pool, "US", "", "010121", "mfn", "10.000", "2023-01-01", None, false, "official").await;
        insert_rate(&pool, "US", "", "010121", "mfn", "12.000", "2024-01-01", None, false, "official").await;

        let res = resolve_active_rate(&pool, "US", "010121", date("2024-06-01"), None)
            .await
            .unwrap();
        let rate = res.value.unwrap();
        assert_eq!(rate.duty_rule, DutyRule::Mfn);
        assert_eq!(rate.rate_pct, "12.000");
    }

    #[tokio::test]
    async fn expired_rows_do_not_match() {
        let pool = test_pool().await;
        insert_rate(
            &pool, "US", "", "010121", "mfn", "16.500", "2020-01-01", Some("2020-12-31"), false,
            "official",
        )
        .await;

        let res = resolve_active_rate(&pool, "US", "010121", date("2024-06-01"), None)
            .await
            .unwrap();
        assert_eq!(res.status, RateStatus::NoMatch);
        assert!(res.value.is_none());
        assert_eq!(res.dataset.as_deref(), Some("official"));
        assert!(res.note.unwrap().contains("2020-01-01"));
    }

    #[tokio::test]
    async fn missing_dataset_is_distinguished() {
        let pool = test_pool().await;

        let res = resolve_active_rate(&pool, "US", "999999", date("2024-06-01"), None)
            .await
            .unwrap();
        assert_eq!(res.status, RateStatus::NoDataset);
        assert!(res.dataset.is_none());
    }

    #[test]
    fn fallback_predicate() {
        assert!(is_partner_compatible_fallback_row(&Partner::Global, Some("CN")));
        assert!(is_partner_compatible_fallback_row(&Partner::Global, None));
        assert!(is_partner_compatible_fallback_row(
            &Partner::Code("CN".to_string()),
            Some("CN")
        ));
        assert!(!is_partner_compatible_fallback_row(
            &Partner::Code("MX".to_string()),
            Some("CN")
        ));
        assert!(!is_partner_compatible_fallback_row(
            &Partner::Code("MX".to_string()),
            None
        ));
    }
}
