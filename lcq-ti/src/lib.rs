//! LCQ Tariff Ingest library
//!
//! Import orchestration and reconciliation core for the landed-cost quoting
//! dataset: run coordination with exactly-one-in-flight semantics, advisory
//! locking, streaming batched upserts with provenance, bounded fan-out
//! scheduling, and cross-model reconciliation of LLM extractions.
//!
//! The per-country fetchers, HTTP API and CLI layers live elsewhere; this
//! crate consumes the [`services::fetcher::RateFetcher`] contract and is
//! consumed through [`services::run_coordinator::run_import`] and the
//! fan-out entry points.

pub mod config;
pub mod db;
pub mod error;
pub mod metrics;
pub mod services;
pub mod types;

pub use crate::error::{ImportError, ImportResult};

use crate::config::IngestConfig;
use crate::metrics::ImportMetrics;
use sqlx::SqlitePool;

/// Shared state for the ingest service
#[derive(Clone)]
pub struct IngestState {
    /// Database connection pool
    pub db: SqlitePool,
    /// Import metrics registry (explicit, per-instance - no global state)
    pub metrics: ImportMetrics,
    /// Ingest configuration
    pub config: IngestConfig,
}

impl IngestState {
    pub fn new(db: SqlitePool, config: IngestConfig) -> Self {
        Self {
            db,
            metrics: ImportMetrics::new(),
            config,
        }
    }
}
