//! Candidate-row contract shared with the external fetchers

use chrono::NaiveDate;
use lcq_common::db::models::{canonical_rate_hash, DutyRule, Partner, RateSource};
use serde::{Deserialize, Serialize};

/// An unvalidated, source-tagged duty-rate fact awaiting upsert or
/// reconciliation. Produced by the per-country fetchers (TARIC XML, HTS
/// JSON, spreadsheets, gazette PDFs, LLM drafts); transient - consumed by
/// the upsert engine and discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRow {
    /// ISO country code of the importing destination
    pub dest: String,
    /// Partner scope; global (empty) means MFN / erga omnes
    #[serde(default)]
    pub partner: Partner,
    /// 6-digit Harmonized System code
    pub hs6: String,
    pub duty_rule: DutyRule,
    /// Decimal string with 3 fractional digits
    pub rate_pct: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub effective_from: NaiveDate,
    #[serde(default)]
    pub effective_to: Option<NaiveDate>,
    /// Structured eligibility flag for the partner-agnostic lookup fallback
    #[serde(default)]
    pub partner_agnostic: bool,
    #[serde(default)]
    pub notes: Option<String>,
    pub source: RateSource,
    /// Cited source URL; doubles as the default provenance reference and as
    /// the official-source classifier input during cross-checking
    #[serde(default)]
    pub source_url: Option<String>,
}

impl CandidateRow {
    /// Natural key used for upsert conflict resolution
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.dest,
            self.partner.as_db_str(),
            self.hs6,
            self.duty_rule.as_str(),
            self.effective_from
        )
    }

    /// Cross-check identity: destination and rate kind only. Effective
    /// dates are deliberately excluded so two sources citing slightly
    /// different but compatible dates can still agree.
    pub fn cross_check_key(&self) -> String {
        format!("{}|{}", self.dest, self.duty_rule.as_str())
    }

    /// Parsed numeric rate, None when malformed
    pub fn rate_value(&self) -> Option<f64> {
        self.rate_pct.parse().ok()
    }

    /// Content hash of the canonical row, comparable with
    /// [`lcq_common::db::models::DutyRate::content_hash`]
    pub fn content_hash(&self) -> String {
        canonical_rate_hash(
            &self.dest,
            self.partner.as_db_str(),
            &self.hs6,
            self.duty_rule.as_str(),
            &self.rate_pct,
            self.currency.as_deref(),
            &self.effective_from.to_string(),
            self.effective_to.map(|d| d.to_string()).as_deref(),
            self.partner_agnostic,
            self.notes.as_deref(),
            self.source.as_str(),
        )
    }

    /// Reject malformed rows before they reach the upsert engine
    pub fn validate(&self) -> Result<(), String> {
        if self.dest.is_empty() {
            return Err("dest must not be empty".to_string());
        }
        if self.hs6.len() != 6 || !self.hs6.bytes().all(|b| b.is_ascii_digit()) {
            return Err(format!("hs6 must be 6 digits, got '{}'", self.hs6));
        }
        if self.rate_pct.parse::<f64>().is_err() {
            return Err(format!("rate_pct is not numeric: '{}'", self.rate_pct));
        }
        if let Some(to) = self.effective_to {
            if to < self.effective_from {
                return Err(format!(
                    "effective_to {} precedes effective_from {}",
                    to, self.effective_from
                ));
            }
        }
        Ok(())
    }
}
