//! Bounded fan-out job scheduler
//!
//! Fans one logical import across independent (destination, partner) fetch
//! jobs. A fixed pool of N workers shares an atomic cursor into the job
//! list; each worker runs fetch + upsert for its job before pulling the
//! next, so peak memory stays bounded to roughly N batches in flight and
//! concurrent fetches never exceed the remote source's rate-limit budget.

use crate::error::ImportError;
use crate::services::fetcher::{FetchParams, RateFetcher};
use crate::services::run_coordinator::{run_import, RunContext, WorkOutput};
use crate::services::upsert_engine::{self, UpsertOptions};
use crate::IngestState;
use lcq_common::db::models::Partner;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// One independent fetch+upsert unit
pub struct FetchJob {
    /// Log/report label, e.g. "US:mfn" or "US:CA"
    pub label: String,
    pub params: FetchParams,
    pub fetcher: Arc<dyn RateFetcher>,
}

/// Scheduler tuning
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Fixed worker count; each job performs its own remote fetches
    pub concurrency: usize,
    pub upsert: UpsertOptions,
    /// Checked between jobs only: a cancelled worker finishes its current
    /// job and stops pulling
    pub cancel: CancellationToken,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 3,
            upsert: UpsertOptions::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Aggregated fan-out result, distinguishing fully successful, partially
/// degraded and total failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    pub fetched_rows: u64,
    pub failed_jobs: usize,
    pub total_jobs: usize,
    pub inserted: u64,
    pub updated: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct WorkerTally {
    fetched_rows: u64,
    inserted: u64,
    updated: u64,
    failed_jobs: usize,
}

/// Run all jobs with fixed concurrency.
///
/// A job's fetch failure is logged and counted, never propagated: it must
/// not abort sibling jobs. The import as a whole fails only when every job
/// produced zero rows.
pub async fn run_jobs(
    pool: &SqlitePool,
    jobs: Vec<FetchJob>,
    opts: SchedulerOptions,
) -> Result<FanoutSummary, ImportError> {
    let total_jobs = jobs.len();
    if total_jobs == 0 {
        return Err(ImportError::NoRowsProduced { total_jobs: 0 });
    }

    let jobs = Arc::new(jobs);
    let opts = Arc::new(opts);
    let cursor = Arc::new(AtomicUsize::new(0));
    let worker_count = opts.concurrency.max(1).min(total_jobs);

    tracing::info!(total_jobs, workers = worker_count, "Fan-out import starting");

    let mut workers = JoinSet::new();
    for worker_id in 0..worker_count {
        let jobs = Arc::clone(&jobs);
        let opts = Arc::clone(&opts);
        let cursor = Arc::clone(&cursor);
        let pool = pool.clone();

        workers.spawn(async move {
            let mut tally = WorkerTally::default();
            loop {
                if opts.cancel.is_cancelled() {
                    tracing::info!(worker_id, "Cancellation requested, worker stopping between jobs");
                    break;
                }
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= jobs.len() {
                    break;
                }
                let job = &jobs[index];
                match run_one_job(&pool, job, &opts).await {
                    Ok(outcome) => {
                        tally.fetched_rows += outcome.fetched_rows;
                        tally.inserted += outcome.inserted;
                        tally.updated += outcome.updated;
                    }
                    Err(e) => {
                        tally.failed_jobs += 1;
                        tracing::warn!(
                            job = %job.label,
                            error = %format!("{:#}", e),
                            "Fetch job failed, treating as zero rows"
                        );
                    }
                }
            }
            tally
        });
    }

    let mut summary = FanoutSummary {
        total_jobs,
        ..Default::default()
    };
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(tally) => {
                summary.fetched_rows += tally.fetched_rows;
                summary.inserted += tally.inserted;
                summary.updated += tally.updated;
                summary.failed_jobs += tally.failed_jobs;
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduler worker panicked");
            }
        }
    }

    if summary.fetched_rows == 0 {
        return Err(ImportError::NoRowsProduced { total_jobs });
    }

    tracing::info!(
        fetched_rows = summary.fetched_rows,
        failed_jobs = summary.failed_jobs,
        inserted = summary.inserted,
        "Fan-out import finished"
    );
    Ok(summary)
}

#[derive(Debug, Default, Clone, Copy)]
struct JobOutcome {
    fetched_rows: u64,
    inserted: u64,
    updated: u64,
}

async fn run_one_job(
    pool: &SqlitePool,
    job: &FetchJob,
    opts: &SchedulerOptions,
) -> anyhow::Result<JobOutcome> {
    tracing::debug!(job = %job.label, "Fetching candidate rows");
    let rows = job.fetcher.fetch(&job.params).await?;
    let fetched_rows = rows.len() as u64;

    if rows.is_empty() {
        tracing::debug!(job = %job.label, "Fetch produced no rows");
        return Ok(JobOutcome::default());
    }

    // Upsert this job's rows before pulling the next job
    let applied = upsert_engine::upsert_rows(pool, rows, &opts.upsert).await?;
    tracing::info!(
        job = %job.label,
        fetched_rows,
        inserted = applied.inserted,
        updated = applied.updated,
        "Fetch job applied"
    );

    Ok(JobOutcome {
        fetched_rows,
        inserted: applied.inserted,
        updated: applied.updated,
    })
}

/// Command-shaped parameters for a WITS-style fan-out import
#[derive(Debug, Clone, Default)]
pub struct WitsImportParams {
    pub dests: Vec<String>,
    /// Preferential partners; empty schedules no preferential jobs
    pub partners: Vec<String>,
    /// Tariff year, None = latest available
    pub year: Option<i32>,
    /// Extra years of history per job
    pub backfill_years: Option<u8>,
    /// Restrict every job to these HS6 codes, empty = full schedules
    pub hs6_list: Vec<String>,
}

/// Build the WITS-style fan-out: one MFN job per destination plus one
/// preferential job per (destination, partner) pair.
pub fn wits_jobs(fetcher: Arc<dyn RateFetcher>, params: &WitsImportParams) -> Vec<FetchJob> {
    let mut jobs = Vec::with_capacity(params.dests.len() * (1 + params.partners.len()));
    for dest in &params.dests {
        jobs.push(FetchJob {
            label: format!("{}:mfn", dest),
            params: FetchParams {
                dest: dest.clone(),
                partner: Partner::Global,
                year: params.year,
                backfill_years: params.backfill_years,
                hs6_list: params.hs6_list.clone(),
            },
            fetcher: Arc::clone(&fetcher),
        });
        for partner in &params.partners {
            jobs.push(FetchJob {
                label: format!("{}:{}", dest, partner),
                params: FetchParams {
                    dest: dest.clone(),
                    partner: Partner::Code(partner.clone()),
                    year: params.year,
                    backfill_years: params.backfill_years,
                    hs6_list: params.hs6_list.clone(),
                },
                fetcher: Arc::clone(&fetcher),
            });
        }
    }
    jobs
}

/// Coordinated WITS-style import: one run record and one advisory lock
/// around the whole fan-out, provenance attributed to the run.
pub async fn run_wits_import(
    state: &IngestState,
    fetcher: Arc<dyn RateFetcher>,
    params: WitsImportParams,
) -> Result<FanoutSummary, ImportError> {
    let jobs = wits_jobs(Arc::clone(&fetcher), &params);
    let ctx = RunContext::new(fetcher.source_name(), "tariff-fanout").with_params(
        serde_json::json!({
            "dests": params.dests,
            "partners": params.partners,
            "year": params.year,
            "backfillYears": params.backfill_years,
            "hs6List": params.hs6_list,
        }),
    );
    let db = state.db.clone();
    let batch_size = state.config.batch_size;
    let concurrency = state.config.fetch_concurrency;

    run_import(state, ctx, |run_id| async move {
        let opts = SchedulerOptions {
            concurrency,
            upsert: UpsertOptions {
                batch_size,
                import_id: Some(run_id),
                ..Default::default()
            },
            cancel: CancellationToken::new(),
        };
        let summary = run_jobs(&db, jobs, opts).await?;
        Ok(WorkOutput {
            inserted: summary.inserted,
            payload: summary,
        })
    })
    .await
}
