//! Fetcher contract
//!
//! The per-source fetchers (TARIC XML, HTS JSON, spreadsheet and gazette
//! parsers, LLM extractors) live outside this crate. They must not write to
//! the database and must be safe to retry; all ingestion goes through the
//! upsert engine under a coordinated run.

use crate::types::CandidateRow;
use anyhow::Result;
use async_trait::async_trait;
use lcq_common::db::models::Partner;

/// Parameters for one fetch job
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Destination country to fetch rates for
    pub dest: String,
    /// Partner scope: global requests the MFN schedule, a code requests
    /// the preferential schedule for that partner
    pub partner: Partner,
    /// Tariff year, None = latest available
    pub year: Option<i32>,
    /// Extra years of history to request
    pub backfill_years: Option<u8>,
    /// Restrict to specific HS6 codes, empty = full schedule
    pub hs6_list: Vec<String>,
}

/// One external rate source
#[async_trait]
pub trait RateFetcher: Send + Sync {
    /// Source name used in run records, lock keys and logs (e.g. "wits")
    fn source_name(&self) -> &str;

    /// Fetch candidate rows for one (destination, partner) job
    async fn fetch(&self, params: &FetchParams) -> Result<Vec<CandidateRow>>;
}
