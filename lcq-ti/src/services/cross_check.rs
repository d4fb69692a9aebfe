//! Cross-model reconciliation
//!
//! Merges two independently-fetched LLM candidate sets into one decided
//! row set. Agreement within tolerance decides; disagreement is resolved
//! by mode, with conflicts returned as data for manual review rather than
//! guessed away. Decided rows are retagged `llm` regardless of which of
//! the two models supplied them.

use crate::config::CrossCheckConfig;
use crate::types::CandidateRow;
use lcq_common::db::models::RateSource;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;

/// How disagreements and single-source claims are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossCheckMode {
    /// Never guess: any disagreement or single-source claim is a conflict
    Strict,
    /// Decide only when an official citation backs one side
    PreferOfficial,
    /// Always decide, preferring the official side when there is one
    Any,
}

impl CrossCheckMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CrossCheckMode::Strict => "strict",
            CrossCheckMode::PreferOfficial => "prefer_official",
            CrossCheckMode::Any => "any",
        }
    }
}

impl FromStr for CrossCheckMode {
    type Err = lcq_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(CrossCheckMode::Strict),
            "prefer_official" => Ok(CrossCheckMode::PreferOfficial),
            "any" => Ok(CrossCheckMode::Any),
            other => Err(lcq_common::Error::InvalidInput(format!(
                "unknown cross-check mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CrossCheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An unresolved disagreement, surfaced for manual review
#[derive(Debug, Clone)]
pub struct CrossCheckConflict {
    pub key: String,
    pub left: Option<CandidateRow>,
    pub right: Option<CandidateRow>,
    pub reason: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub decided: Vec<CandidateRow>,
    pub conflicts: Vec<CrossCheckConflict>,
}

/// Result of a coordinated cross-checked import
#[derive(Debug)]
pub struct CrossCheckImportSummary {
    pub decided: usize,
    pub inserted: u64,
    pub updated: u64,
    /// Returned for manual review, never silently dropped
    pub conflicts: Vec<CrossCheckConflict>,
}

/// Coordinated cross-checked LLM import: reconcile the two fetches under
/// one run record and ingest only the decided rows, retagged `llm`.
pub async fn run_cross_check_import<FA, FutA, FB, FutB>(
    state: &crate::IngestState,
    source: &str,
    job: &str,
    fetch_a: FA,
    fetch_b: FB,
    mode: CrossCheckMode,
) -> Result<CrossCheckImportSummary, crate::ImportError>
where
    FA: FnOnce() -> FutA,
    FutA: Future<Output = anyhow::Result<Vec<CandidateRow>>>,
    FB: FnOnce() -> FutB,
    FutB: Future<Output = anyhow::Result<Vec<CandidateRow>>>,
{
    use crate::services::run_coordinator::{run_import, RunContext, WorkOutput};
    use crate::services::upsert_engine::{upsert_rows, UpsertOptions};

    let ctx = RunContext::new(source, job)
        .with_params(serde_json::json!({ "mode": mode.as_str() }));
    let db = state.db.clone();
    let batch_size = state.config.batch_size;
    let cfg = state.config.cross_check.clone();

    run_import(state, ctx, |run_id| async move {
        let reconciled = reconcile(fetch_a, fetch_b, mode, &cfg).await?;
        let decided = reconciled.decided.len();

        let opts = UpsertOptions {
            batch_size,
            import_id: Some(run_id),
            source_override: Some(RateSource::Llm),
            ..Default::default()
        };
        let applied = upsert_rows(&db, reconciled.decided, &opts).await?;

        Ok(WorkOutput {
            inserted: applied.inserted,
            payload: CrossCheckImportSummary {
                decided,
                inserted: applied.inserted,
                updated: applied.updated,
                conflicts: reconciled.conflicts,
            },
        })
    })
    .await
}

/// Fetch both candidate sets independently (fetchers must not ingest on
/// their own) and reconcile them.
pub async fn reconcile<FA, FutA, FB, FutB>(
    fetch_a: FA,
    fetch_b: FB,
    mode: CrossCheckMode,
    cfg: &CrossCheckConfig,
) -> anyhow::Result<Reconciliation>
where
    FA: FnOnce() -> FutA,
    FutA: Future<Output = anyhow::Result<Vec<CandidateRow>>>,
    FB: FnOnce() -> FutB,
    FutB: Future<Output = anyhow::Result<Vec<CandidateRow>>>,
{
    let (left, right) = tokio::try_join!(fetch_a(), fetch_b())?;
    Ok(reconcile_sets(left, right, mode, cfg))
}

/// Reconcile two already-fetched candidate sets.
pub fn reconcile_sets(
    left: Vec<CandidateRow>,
    right: Vec<CandidateRow>,
    mode: CrossCheckMode,
    cfg: &CrossCheckConfig,
) -> Reconciliation {
    // Duplicate keys within one extraction are a fetcher bug; last one wins
    let mut left: BTreeMap<String, CandidateRow> = left
        .into_iter()
        .map(|row| (row.cross_check_key(), row))
        .collect();
    let mut right: BTreeMap<String, CandidateRow> = right
        .into_iter()
        .map(|row| (row.cross_check_key(), row))
        .collect();

    let keys: BTreeSet<String> = left.keys().chain(right.keys()).cloned().collect();
    let mut out = Reconciliation::default();

    for key in keys {
        match (left.remove(&key), right.remove(&key)) {
            (Some(l), Some(r)) => reconcile_pair(&key, l, r, mode, cfg, &mut out),
            (Some(l), None) => reconcile_single(&key, l, "first", mode, cfg, &mut out),
            (None, Some(r)) => reconcile_single(&key, r, "second", mode, cfg, &mut out),
            (None, None) => unreachable!("key came from one of the sets"),
        }
    }

    tracing::info!(
        mode = %mode,
        decided = out.decided.len(),
        conflicts = out.conflicts.len(),
        "Cross-check reconciliation complete"
    );
    out
}

fn reconcile_pair(
    key: &str,
    l: CandidateRow,
    r: CandidateRow,
    mode: CrossCheckMode,
    cfg: &CrossCheckConfig,
    out: &mut Reconciliation,
) {
    let l_official = is_official(&l, cfg);
    let r_official = is_official(&r, cfg);

    if rates_agree(&l, &r, cfg) && structurally_compatible(&l, &r) {
        // Agreement: keep the officially-cited side when exactly one is,
        // defaulting to the first source
        let keep = if r_official && !l_official { r } else { l };
        out.decided.push(retag(keep));
        return;
    }

    match mode {
        CrossCheckMode::Any => {
            let keep = if r_official && !l_official { r } else { l };
            out.decided.push(retag(keep));
        }
        CrossCheckMode::PreferOfficial => {
            if l_official {
                out.decided.push(retag(l));
            } else if r_official {
                out.decided.push(retag(r));
            } else {
                out.conflicts.push(disagreement(key, l, r));
            }
        }
        CrossCheckMode::Strict => out.conflicts.push(disagreement(key, l, r)),
    }
}

fn reconcile_single(
    key: &str,
    row: CandidateRow,
    side: &str,
    mode: CrossCheckMode,
    cfg: &CrossCheckConfig,
    out: &mut Reconciliation,
) {
    let official = is_official(&row, cfg);
    let decide = match mode {
        CrossCheckMode::Any => true,
        CrossCheckMode::PreferOfficial => official,
        CrossCheckMode::Strict => false,
    };

    if decide {
        out.decided.push(retag(row));
    } else {
        let reason = format!("single-source claim from {} model is not trusted", side);
        let (left, right) = if side == "first" {
            (Some(row), None)
        } else {
            (None, Some(row))
        };
        out.conflicts.push(CrossCheckConflict {
            key: key.to_string(),
            left,
            right,
            reason,
        });
    }
}

fn disagreement(key: &str, l: CandidateRow, r: CandidateRow) -> CrossCheckConflict {
    let reason = format!(
        "models disagree beyond tolerance: {} vs {}",
        l.rate_pct, r.rate_pct
    );
    CrossCheckConflict {
        key: key.to_string(),
        left: Some(l),
        right: Some(r),
        reason,
    }
}

/// Numeric agreement: |a-b| <= max(absolute, relative * |a|). Unparseable
/// rates never agree.
fn rates_agree(l: &CandidateRow, r: &CandidateRow, cfg: &CrossCheckConfig) -> bool {
    match (l.rate_value(), r.rate_value()) {
        (Some(a), Some(b)) => {
            let tolerance = cfg
                .absolute_tolerance
                .max(cfg.relative_tolerance * a.abs());
            (a - b).abs() <= tolerance
        }
        _ => false,
    }
}

/// Structural compatibility: the rows must express the same duty basis
/// (same currency qualifier)
fn structurally_compatible(l: &CandidateRow, r: &CandidateRow) -> bool {
    l.currency == r.currency
}

fn is_official(row: &CandidateRow, cfg: &CrossCheckConfig) -> bool {
    row.source_url
        .as_deref()
        .map(|u| cfg.official.is_official(u))
        .unwrap_or(false)
}

/// Decided rows enter the store as `llm` regardless of the supplying model
fn retag(mut row: CandidateRow) -> CandidateRow {
    row.source = RateSource::Llm;
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use lcq_common::db::models::{DutyRule, Partner};

    fn claim(dest: &str, rule: DutyRule, rate: &str, url: Option<&str>) -> CandidateRow {
        CandidateRow {
            dest: dest.to_string(),
            partner: Partner::Global,
            hs6: "010121".to_string(),
            duty_rule: rule,
            rate_pct: rate.to_string(),
            currency: None,
            effective_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            effective_to: None,
            partner_agnostic: false,
            notes: None,
            source: RateSource::Manual,
            source_url: url.map(|u| u.to_string()),
        }
    }

    fn cfg() -> CrossCheckConfig {
        CrossCheckConfig::default()
    }

    #[test]
    fn close_rates_agree_and_prefer_official() {
        let l = claim("US", DutyRule::Mfn, "16.500", Some("https://llm-a.example/answer"));
        let r = claim("US", DutyRule::Mfn, "16.600", Some("https://www.wto.org/tariffs/us"));

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg());
        assert_eq!(result.decided.len(), 1);
        assert!(result.conflicts.is_empty());
        // The officially-cited side won, and the row was retagged llm
        assert_eq!(result.decided[0].rate_pct, "16.600");
        assert_eq!(result.decided[0].source, RateSource::Llm);
    }

    #[test]
    fn agreement_defaults_to_first_source() {
        let l = claim("US", DutyRule::Mfn, "16.500", Some("https://llm-a.example/x"));
        let r = claim("US", DutyRule::Mfn, "16.550", Some("https://llm-b.example/y"));

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg());
        assert_eq!(result.decided.len(), 1);
        assert_eq!(result.decided[0].rate_pct, "16.500");
    }

    #[test]
    fn strict_disagreement_is_a_conflict() {
        let l = claim("US", DutyRule::Mfn, "16.500", Some("https://www.wto.org/tariffs/us"));
        let r = claim("US", DutyRule::Mfn, "20.000", None);

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg());
        assert!(result.decided.is_empty());
        assert_eq!(result.conflicts.len(), 1);
        assert!(result.conflicts[0].reason.contains("disagree"));
        assert!(result.conflicts[0].left.is_some());
        assert!(result.conflicts[0].right.is_some());
    }

    #[test]
    fn prefer_official_resolves_disagreement_with_official_side() {
        let l = claim("US", DutyRule::Mfn, "16.500", Some("https://www.wto.org/tariffs/us"));
        let r = claim("US", DutyRule::Mfn, "20.000", None);

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::PreferOfficial, &cfg());
        assert_eq!(result.decided.len(), 1);
        assert_eq!(result.decided[0].rate_pct, "16.500");

        // Without an official citation on either side, still a conflict
        let l = claim("US", DutyRule::Mfn, "16.500", None);
        let r = claim("US", DutyRule::Mfn, "20.000", None);
        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::PreferOfficial, &cfg());
        assert!(result.decided.is_empty());
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn any_mode_always_decides() {
        let l = claim("US", DutyRule::Mfn, "16.500", None);
        let r = claim("US", DutyRule::Mfn, "20.000", Some("https://www.wto.org/tariffs/us"));

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Any, &cfg());
        assert_eq!(result.decided.len(), 1);
        // Official side preferred
        assert_eq!(result.decided[0].rate_pct, "20.000");
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn single_source_claims_by_mode() {
        let lone = claim("US", DutyRule::Fta, "0.000", Some("https://www.wto.org/fta/us"));

        let strict = reconcile_sets(vec![lone.clone()], vec![], CrossCheckMode::Strict, &cfg());
        assert!(strict.decided.is_empty());
        assert_eq!(strict.conflicts.len(), 1);
        assert!(strict.conflicts[0].reason.contains("single-source"));

        let prefer = reconcile_sets(
            vec![lone.clone()],
            vec![],
            CrossCheckMode::PreferOfficial,
            &cfg(),
        );
        assert_eq!(prefer.decided.len(), 1);

        let unofficial = claim("US", DutyRule::Fta, "0.000", None);
        let prefer = reconcile_sets(
            vec![],
            vec![unofficial.clone()],
            CrossCheckMode::PreferOfficial,
            &cfg(),
        );
        assert!(prefer.decided.is_empty());
        assert_eq!(prefer.conflicts.len(), 1);

        let any = reconcile_sets(vec![], vec![unofficial], CrossCheckMode::Any, &cfg());
        assert_eq!(any.decided.len(), 1);
    }

    #[test]
    fn near_dates_still_agree() {
        // Cross-check identity excludes effective dates
        let mut l = claim("US", DutyRule::Mfn, "16.500", None);
        let mut r = claim("US", DutyRule::Mfn, "16.500", None);
        l.effective_from = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        r.effective_from = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg());
        assert_eq!(result.decided.len(), 1);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn currency_mismatch_is_not_agreement() {
        let l = claim("US", DutyRule::Mfn, "16.500", None);
        let mut r = claim("US", DutyRule::Mfn, "16.500", None);
        r.currency = Some("EUR".to_string());

        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg());
        assert!(result.decided.is_empty());
        assert_eq!(result.conflicts.len(), 1);
    }

    #[test]
    fn distinct_keys_reconcile_independently() {
        let mfn = claim("US", DutyRule::Mfn, "16.500", None);
        let fta = claim("US", DutyRule::Fta, "0.000", None);

        let result = reconcile_sets(
            vec![mfn.clone(), fta.clone()],
            vec![mfn, fta],
            CrossCheckMode::Strict,
            &cfg(),
        );
        assert_eq!(result.decided.len(), 2);
    }

    #[test]
    fn relative_tolerance_scales_with_magnitude() {
        let mut cfg = cfg();
        cfg.absolute_tolerance = 0.1;
        cfg.relative_tolerance = 0.01;

        // 1% of 100 = 1.0 > 0.1 absolute, so 100.0 vs 100.8 agrees
        let l = claim("US", DutyRule::Mfn, "100.000", None);
        let r = claim("US", DutyRule::Mfn, "100.800", None);
        let result = reconcile_sets(vec![l], vec![r], CrossCheckMode::Strict, &cfg);
        assert_eq!(result.decided.len(), 1);
    }

    #[test]
    fn mode_parses_from_external_flag() {
        assert_eq!(CrossCheckMode::from_str("strict").unwrap(), CrossCheckMode::Strict);
        assert_eq!(
            CrossCheckMode::from_str("prefer_official").unwrap(),
            CrossCheckMode::PreferOfficial
        );
        assert_eq!(CrossCheckMode::from_str("any").unwrap(), CrossCheckMode::Any);
        assert!(CrossCheckMode::from_str("yolo").is_err());
    }

    #[tokio::test]
    async fn coordinated_import_ingests_decided_rows_as_llm() {
        use crate::config::IngestConfig;
        use sqlx::sqlite::SqlitePoolOptions;
        use sqlx::Row;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await.unwrap();
        lcq_common::db::init::create_duty_rates_table(&pool).await.unwrap();
        lcq_common::db::init::create_import_runs_table(&pool).await.unwrap();
        lcq_common::db::init::create_import_provenance_table(&pool).await.unwrap();
        lcq_common::db::init::create_advisory_locks_table(&pool).await.unwrap();
        let state = crate::IngestState::new(pool, IngestConfig::default());

        let agreeing = claim("US", DutyRule::Mfn, "16.500", None);
        let near = claim("US", DutyRule::Mfn, "16.520", None);
        let lone = claim("DE", DutyRule::Mfn, "9.000", None);

        let summary = run_cross_check_import(
            &state,
            "llm",
            "tariff-crosscheck",
            || async move { Ok(vec![agreeing, lone]) },
            || async move { Ok(vec![near]) },
            CrossCheckMode::Strict,
        )
        .await
        .unwrap();

        // The agreeing pair decided; the single-source DE claim conflicted
        assert_eq!(summary.decided, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.conflicts.len(), 1);

        let row = sqlx::query("SELECT source, rate_pct FROM duty_rates")
            .fetch_one(&state.db)
            .await
            .unwrap();
        let source: String = row.get("source");
        let rate: String = row.get("rate_pct");
        assert_eq!(source, "llm");
        assert_eq!(rate, "16.500");
    }

    #[tokio::test]
    async fn reconcile_fetches_both_sides() {
        let result = reconcile(
            || async { Ok(vec![claim("US", DutyRule::Mfn, "16.500", None)]) },
            || async { Ok(vec![claim("US", DutyRule::Mfn, "16.520", None)]) },
            CrossCheckMode::Strict,
            &cfg(),
        )
        .await
        .unwrap();

        assert_eq!(result.decided.len(), 1);
    }
}
