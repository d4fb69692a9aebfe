//! Import orchestration services

pub mod advisory_lock;
pub mod cross_check;
pub mod fetcher;
pub mod job_scheduler;
pub mod run_coordinator;
pub mod upsert_engine;

pub use advisory_lock::AdvisoryLock;
pub use cross_check::{
    reconcile, reconcile_sets, run_cross_check_import, CrossCheckConflict,
    CrossCheckImportSummary, CrossCheckMode, Reconciliation,
};
pub use fetcher::{FetchParams, RateFetcher};
pub use job_scheduler::{
    run_jobs, run_wits_import, wits_jobs, FanoutSummary, FetchJob, SchedulerOptions,
    WitsImportParams,
};
pub use run_coordinator::{run_import, RunContext, WorkOutput};
pub use upsert_engine::{upsert_rows, upsert_stream, UpsertOptions, UpsertSummary};
