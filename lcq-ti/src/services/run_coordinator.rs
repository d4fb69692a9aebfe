//! Import run coordination
//!
//! Wraps one logical import with exactly-one-in-flight semantics per lock
//! key: advisory lock, run ledger record, metrics, and guaranteed lock
//! release. Different lock keys run fully concurrently with no shared
//! mutable state beyond the database.

use crate::db::runs;
use crate::error::ImportError;
use crate::services::advisory_lock::AdvisoryLock;
use crate::IngestState;
use chrono::Utc;
use std::future::Future;
use uuid::Uuid;

/// Identity and parameters of one logical import
#[derive(Debug, Clone)]
pub struct RunContext {
    pub source: String,
    pub job: String,
    pub params: serde_json::Value,
    /// Override for the advisory lock key, default `source:job`
    pub lock_key: Option<String>,
}

impl RunContext {
    pub fn new(source: impl Into<String>, job: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            job: job.into(),
            params: serde_json::json!({}),
            lock_key: None,
        }
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = Some(key.into());
        self
    }

    pub fn effective_lock_key(&self) -> String {
        self.lock_key
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.source, self.job))
    }
}

/// Result of the work closure: the inserted-row tally for metrics and the
/// ledger, plus the caller-visible payload
#[derive(Debug)]
pub struct WorkOutput<T> {
    pub inserted: u64,
    pub payload: T,
}

/// Execute one coordinated import run.
///
/// Guarantees: at most one in-flight run per lock key; every run that
/// acquires the lock gets exactly one terminal ledger record; the lock is
/// released on success and failure alike; caller-visible errors are never
/// swallowed by bookkeeping failures.
pub async fn run_import<F, Fut, T>(
    state: &IngestState,
    ctx: RunContext,
    work: F,
) -> Result<T, ImportError>
where
    F: FnOnce(Uuid) -> Fut,
    Fut: Future<Output = anyhow::Result<WorkOutput<T>>>,
{
    let lock_key = ctx.effective_lock_key();

    let acquired = match AdvisoryLock::acquire(&state.db, &lock_key).await {
        Ok(acquired) => acquired,
        Err(e) => {
            state.metrics.inc_error(&ctx.source, &ctx.job, "lock");
            // Safeguard release: harmless when the insert never took effect
            AdvisoryLock::release(&state.db, &lock_key).await;
            return Err(ImportError::Other(e));
        }
    };

    if !acquired {
        state.metrics.inc_error(&ctx.source, &ctx.job, "lock");
        tracing::warn!(
            source = %ctx.source,
            job = %ctx.job,
            lock_key = %lock_key,
            "Import rejected: already running"
        );
        return Err(ImportError::AlreadyRunning { lock_key });
    }

    let timer = state.metrics.start_timer(&ctx.source, &ctx.job);

    // The run record exists before any work happens, so even a work closure
    // that dies on its first await leaves a terminal audit row behind.
    let run_id = match runs::create_run(&state.db, &ctx.source, &ctx.job, &ctx.params).await {
        Ok(id) => id,
        Err(e) => {
            timer.observe();
            state.metrics.inc_error(&ctx.source, &ctx.job, "script");
            AdvisoryLock::release(&state.db, &lock_key).await;
            return Err(ImportError::Other(e));
        }
    };

    tracing::info!(
        source = %ctx.source,
        job = %ctx.job,
        run_id = %run_id,
        "Import run started"
    );

    let outcome = work(run_id).await;

    let result = match outcome {
        Ok(WorkOutput { inserted, payload }) => {
            match runs::mark_succeeded(&state.db, run_id, inserted as i64).await {
                Ok(()) => {
                    state.metrics.add_rows_inserted(&ctx.source, &ctx.job, inserted);
                    state.metrics.set_last_run(&ctx.source, &ctx.job, Utc::now());
                    tracing::info!(
                        source = %ctx.source,
                        job = %ctx.job,
                        run_id = %run_id,
                        inserted,
                        "Import run succeeded"
                    );
                    Ok(payload)
                }
                Err(e) => {
                    state.metrics.inc_error(&ctx.source, &ctx.job, "script");
                    Err(ImportError::Other(e))
                }
            }
        }
        Err(err) => {
            state.metrics.inc_error(&ctx.source, &ctx.job, "script");
            // Best-effort ledger update; the original error always wins
            if let Err(e) = runs::mark_failed(&state.db, run_id, &format!("{:#}", err)).await {
                tracing::error!(
                    run_id = %run_id,
                    error = %e,
                    "Failed to record import run failure"
                );
            }
            tracing::error!(
                source = %ctx.source,
                job = %ctx.job,
                run_id = %run_id,
                error = %err,
                "Import run failed"
            );
            Err(ImportError::Other(err))
        }
    };

    timer.observe();
    AdvisoryLock::release(&state.db, &lock_key).await;
    result
}
