//! Shared domain models for duty-rate data

use crate::Error;
use chrono::NaiveDate;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Origin of a stored duty-rate fact, ranked for conflict resolution.
///
/// Precedence is declared once here rather than scattered through string
/// comparisons: `official` > `wits` > `llm` > `manual` = `vendor`. Equal
/// precedence overwrites (a newer official refresh replaces the old one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    Official,
    Wits,
    Llm,
    Manual,
    Vendor,
}

impl RateSource {
    /// Numeric rank used by the upsert engine's conflict resolution
    pub fn precedence(self) -> u8 {
        match self {
            RateSource::Official => 4,
            RateSource::Wits => 3,
            RateSource::Llm => 2,
            RateSource::Manual => 1,
            RateSource::Vendor => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateSource::Official => "official",
            RateSource::Wits => "wits",
            RateSource::Llm => "llm",
            RateSource::Manual => "manual",
            RateSource::Vendor => "vendor",
        }
    }
}

impl FromStr for RateSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "official" => Ok(RateSource::Official),
            "wits" => Ok(RateSource::Wits),
            "llm" => Ok(RateSource::Llm),
            "manual" => Ok(RateSource::Manual),
            "vendor" => Ok(RateSource::Vendor),
            other => Err(Error::InvalidInput(format!("unknown rate source: {}", other))),
        }
    }
}

impl fmt::Display for RateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of duty a rate row expresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DutyRule {
    Mfn,
    Fta,
    AntiDumping,
    Safeguard,
}

impl DutyRule {
    pub fn as_str(self) -> &'static str {
        match self {
            DutyRule::Mfn => "mfn",
            DutyRule::Fta => "fta",
            DutyRule::AntiDumping => "anti_dumping",
            DutyRule::Safeguard => "safeguard",
        }
    }
}

impl FromStr for DutyRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "mfn" => Ok(DutyRule::Mfn),
            "fta" => Ok(DutyRule::Fta),
            "anti_dumping" => Ok(DutyRule::AntiDumping),
            "safeguard" => Ok(DutyRule::Safeguard),
            other => Err(Error::InvalidInput(format!("unknown duty rule: {}", other))),
        }
    }
}

impl fmt::Display for DutyRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading-partner scope of a rate row.
///
/// `Global` maps to the empty string in the database and means "applies to
/// all partners" (MFN / erga omnes). It is a first-class value, distinct
/// from "missing/unspecified" - there is no null partner.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Partner {
    Global,
    Code(String),
}

impl Partner {
    /// Database representation: `''` for global, the partner code otherwise
    pub fn as_db_str(&self) -> &str {
        match self {
            Partner::Global => "",
            Partner::Code(code) => code.as_str(),
        }
    }

    pub fn from_db_str(s: &str) -> Self {
        if s.is_empty() {
            Partner::Global
        } else {
            Partner::Code(s.to_string())
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, Partner::Global)
    }
}

impl Default for Partner {
    fn default() -> Self {
        Partner::Global
    }
}

impl fmt::Display for Partner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

impl Serialize for Partner {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_db_str())
    }
}

impl<'de> Deserialize<'de> for Partner {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Partner::from_db_str(&s))
    }
}

/// A persisted duty-rate row
#[derive(Debug, Clone)]
pub struct DutyRate {
    pub id: Uuid,
    pub dest: String,
    pub partner: Partner,
    pub hs6: String,
    pub duty_rule: DutyRule,
    /// Decimal string with 3 fractional digits (e.g. "16.500")
    pub rate_pct: String,
    pub currency: Option<String>,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    /// Structured flag marking a global row as eligible for the
    /// partner-agnostic lookup fallback
    pub partner_agnostic: bool,
    pub notes: Option<String>,
    pub source: RateSource,
}

impl DutyRate {
    /// Parsed numeric rate, None when the stored string is malformed
    pub fn rate_value(&self) -> Option<f64> {
        self.rate_pct.parse().ok()
    }

    /// Content hash of the canonical row, used to detect no-op upserts
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
}

/// SHA-256 over a canonical field rendering of one duty-rate row.
///
/// Candidate rows and stored rows hash through the same function, so a
/// byte-identical upsert is recognizable as a true no-op.
#[allow(clippy::too_many_arguments)]
pub fn canonical_rate_hash(
    dest: &str,
    partner: &str,
    hs6: &str,
    duty_rule: &str,
    rate_pct: &str,
    currency: Option<&str>,
    effective_from: &str,
    effective_to: Option<&str>,
    partner_agnostic: bool,
    notes: Option<&str>,
    source: &str,
) -> String {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
        dest,
        partner,
        hs6,
        duty_rule,
        rate_pct,
        currency.unwrap_or(""),
        effective_from,
        effective_to.unwrap_or(""),
        partner_agnostic as u8,
        notes.unwrap_or(""),
        source,
    );
    format!("{:x}", Sha256::digest(canonical.as_bytes()))
}
