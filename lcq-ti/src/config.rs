//! Ingest configuration
//!
//! Tunables for batch sizing, fan-out concurrency, cross-check tolerances
//! and the official-source allow-list. The allow-list is configuration
//! data, not code: new authorities are added in the TOML file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use url::Url;

/// Top-level ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Rows per upsert transaction
    pub batch_size: usize,
    /// Concurrent fetch workers per fan-out import. Tune below the remote
    /// source's rate-limit tolerance: each job performs its own fetches.
    pub fetch_concurrency: usize,
    pub cross_check: CrossCheckConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            fetch_concurrency: 3,
            cross_check: CrossCheckConfig::default(),
        }
    }
}

/// Cross-check reconciliation tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossCheckConfig {
    /// Two rates agree when |a-b| <= max(absolute, relative * |a|)
    pub absolute_tolerance: f64,
    pub relative_tolerance: f64,
    pub official: OfficialSourceConfig,
}

impl Default for CrossCheckConfig {
    fn default() -> Self {
        Self {
            absolute_tolerance: 0.1,
            relative_tolerance: 0.01,
            official: OfficialSourceConfig::default(),
        }
    }
}

/// Official-source classification: a cited URL counts as official when its
/// host equals or is a subdomain of an allow-listed government or
/// intergovernmental domain, optionally gated by path keywords.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficialSourceConfig {
    pub domains: Vec<String>,
    /// When non-empty, the URL path must also contain one of these
    pub path_keywords: Vec<String>,
}

impl Default for OfficialSourceConfig {
    fn default() -> Self {
        Self {
            domains: [
                "wto.org",
                "wcoomd.org",
                "europa.eu",
                "usitc.gov",
                "cbp.gov",
                "gov.uk",
                "canada.ca",
                "cbsa-asfc.gc.ca",
                "customs.go.jp",
                "abf.gov.au",
                "admin.ch",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            path_keywords: Vec::new(),
        }
    }
}

impl OfficialSourceConfig {
    /// Pure classification function of the cited source URL
    pub fn is_official(&self, source_url: &str) -> bool {
        let parsed = match Url::parse(source_url) {
            Ok(u) => u,
            Err(_) => return false,
        };
        let host = match parsed.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        };

        let host_matches = self
            .domains
            .iter()
            .any(|d| host == *d || host.ends_with(&format!(".{}", d)));
        if !host_matches {
            return false;
        }

        if self.path_keywords.is_empty() {
            return true;
        }
        let path = parsed.path().to_ascii_lowercase();
        self.path_keywords
            .iter()
            .any(|k| path.contains(&k.to_ascii_lowercase()))
    }
}

impl IngestConfig {
    /// Load configuration: explicit path, then the LCQ_CONFIG environment
    /// variable, then built-in defaults. A missing or malformed file falls
    /// back to defaults with a warning rather than refusing to start.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("LCQ_CONFIG").ok().map(PathBuf::from));

        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Malformed ingest config, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Could not read ingest config, using defaults"
                );
                Self::default()
            }
        }
    }
}
