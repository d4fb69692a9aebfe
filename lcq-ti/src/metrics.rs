//! Import metrics registry
//!
//! Counters and timers recorded around every import run: errors by stage,
//! rows inserted, last-run timestamps and run durations. The registry is an
//! explicit object carried on `IngestState` so tests construct fresh
//! instances without cross-test leakage.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
struct MetricsInner {
    /// import_errors{source, job, stage}
    errors: HashMap<(String, String, String), u64>,
    /// import_rows_inserted{source, job}
    rows_inserted: HashMap<(String, String), u64>,
    /// last_run_timestamp{source, job}
    last_run: HashMap<(String, String), DateTime<Utc>>,
    /// run durations per (source, job)
    durations: HashMap<(String, String), Vec<Duration>>,
}

/// Cheap-to-clone metrics handle shared across the ingest service
#[derive(Clone, Default)]
pub struct ImportMetrics {
    inner: Arc<Mutex<MetricsInner>>,
}

impl ImportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsInner> {
        self.inner.lock().expect("metrics mutex poisoned")
    }

    /// Increment import_errors{source, job, stage}
    pub fn inc_error(&self, source: &str, job: &str, stage: &str) {
        *self
            .lock()
            .errors
            .entry((source.to_string(), job.to_string(), stage.to_string()))
            .or_insert(0) += 1;
    }

    /// Add to import_rows_inserted{source, job}
    pub fn add_rows_inserted(&self, source: &str, job: &str, rows: u64) {
        *self
            .lock()
            .rows_inserted
            .entry((source.to_string(), job.to_string()))
            .or_insert(0) += rows;
    }

    /// Record last_run_timestamp{source, job}
    pub fn set_last_run(&self, source: &str, job: &str, at: DateTime<Utc>) {
        self.lock()
            .last_run
            .insert((source.to_string(), job.to_string()), at);
    }

    /// Start the duration timer for one run. The returned timer records on
    /// `observe`, on success and failure paths alike.
    pub fn start_timer(&self, source: &str, job: &str) -> RunTimer {
        RunTimer {
            metrics: self.clone(),
            source: source.to_string(),
            job: job.to_string(),
            started: Instant::now(),
        }
    }

    fn record_duration(&self, source: &str, job: &str, elapsed: Duration) {
        self.lock()
            .durations
            .entry((source.to_string(), job.to_string()))
            .or_default()
            .push(elapsed);
    }

    // Snapshot accessors, primarily for tests and diagnostics

    pub fn error_count(&self, source: &str, job: &str, stage: &str) -> u64 {
        self.lock()
            .errors
            .get(&(source.to_string(), job.to_string(), stage.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn rows_inserted(&self, source: &str, job: &str) -> u64 {
        self.lock()
            .rows_inserted
            .get(&(source.to_string(), job.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_run(&self, source: &str, job: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .last_run
            .get(&(source.to_string(), job.to_string()))
            .copied()
    }

    pub fn duration_count(&self, source: &str, job: &str) -> usize {
        self.lock()
            .durations
            .get(&(source.to_string(), job.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// In-flight run duration timer
pub struct RunTimer {
    metrics: ImportMetrics,
    source: String,
    job: String,
    started: Instant,
}

impl RunTimer {
    /// Stop the timer and record the elapsed duration
    pub fn observe(self) {
        let elapsed = self.started.elapsed();
        self.metrics.record_duration(&self.source, &self.job, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_label_set() {
        let metrics = ImportMetrics::new();
        metrics.inc_error("wits", "fanout", "lock");
        metrics.inc_error("wits", "fanout", "lock");
        metrics.inc_error("wits", "fanout", "script");

        assert_eq!(metrics.error_count("wits", "fanout", "lock"), 2);
        assert_eq!(metrics.error_count("wits", "fanout", "script"), 1);
        assert_eq!(metrics.error_count("hts", "fanout", "lock"), 0);
    }

    #[test]
    fn rows_inserted_sums() {
        let metrics = ImportMetrics::new();
        metrics.add_rows_inserted("wits", "fanout", 10);
        metrics.add_rows_inserted("wits", "fanout", 5);
        assert_eq!(metrics.rows_inserted("wits", "fanout"), 15);
    }

    #[test]
    fn timer_records_duration() {
        let metrics = ImportMetrics::new();
        let timer = metrics.start_timer("wits", "fanout");
        timer.observe();
        assert_eq!(metrics.duration_count("wits", "fanout"), 1);
    }

    #[test]
    fn instances_are_isolated() {
        let a = ImportMetrics::new();
        let b = ImportMetrics::new();
        a.inc_error("wits", "fanout", "lock");
        assert_eq!(b.error_count("wits", "fanout", "lock"), 0);
    }
}
