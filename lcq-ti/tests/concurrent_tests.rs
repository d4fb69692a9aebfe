//! Integration tests for concurrent import coordination
//!
//! Exercises the at-most-one-in-flight guarantee against a real on-disk
//! database with a multi-connection pool.

use lcq_ti::config::IngestConfig;
use lcq_ti::services::run_coordinator::{run_import, RunContext, WorkOutput};
use lcq_ti::services::AdvisoryLock;
use lcq_ti::{ImportError, IngestState};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinSet;

async fn test_state(temp_dir: &TempDir) -> IngestState {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let db_path = temp_dir.path().join("rates.db");
    let pool = lcq_common::db::init::init_database(&db_path)
        .await
        .expect("Failed to initialize database");
    IngestState::new(pool, IngestConfig::default())
}

#[tokio::test]
async fn concurrent_runs_on_one_key_yield_one_success() {
    let temp_dir = TempDir::new().unwrap();
    let state = test_state(&temp_dir).await;

    let release = Arc::new(Notify::new());

    // First run: holds the lock until notified
    let first = {
        let state = state.clone();
        let release = Arc::clone(&release);
        tokio::spawn(async move {
            run_import(&state, RunContext::new("wits", "fanout"), |_| async move {
                release.notified().await;
                Ok(WorkOutput {
                    inserted: 1,
                    payload: "first",
                })
            })
            .await
        })
    };

    // Wait until the first run has created its ledger record (lock held)
    loop {
        let count = lcq_ti::db::runs::count_runs(&state.db).await.unwrap();
        if count == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    // Second run on the same key must fail immediately, without waiting and
    // without creating a ledger record
    let second: Result<&str, ImportError> =
        run_import(&state, RunContext::new("wits", "fanout"), |_| async {
            Ok(WorkOutput {
                inserted: 0,
                payload: "second",
            })
        })
        .await;

    match second.unwrap_err() {
        ImportError::AlreadyRunning { lock_key } => assert_eq!(lock_key, "wits:fanout"),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }
    assert_eq!(lcq_ti::db::runs::count_runs(&state.db).await.unwrap(), 1);
    assert_eq!(state.metrics.error_count("wits", "fanout", "lock"), 1);

    // Let the first run finish; it must succeed and release the lock
    release.notify_one();
    let first_result = first.await.unwrap();
    assert_eq!(first_result.unwrap(), "first");

    assert!(AdvisoryLock::acquire(&state.db, "wits:fanout").await.unwrap());
}

#[tokio::test]
async fn distinct_lock_keys_run_concurrently() {
    let temp_dir = TempDir::new().unwrap();
    let state = test_state(&temp_dir).await;

    let mut join_set = JoinSet::new();
    for source in ["wits", "hts", "taric", "gazette"] {
        let state = state.clone();
        join_set.spawn(async move {
            run_import(&state, RunContext::new(source, "refresh"), |_| async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(WorkOutput {
                    inserted: 1,
                    payload: source,
                })
            })
            .await
        });
    }

    let mut succeeded = Vec::new();
    while let Some(result) = join_set.join_next().await {
        let payload = result.expect("Task panicked").expect("run failed");
        succeeded.push(payload);
    }

    succeeded.sort_unstable();
    assert_eq!(succeeded, vec!["gazette", "hts", "taric", "wits"]);
    assert_eq!(lcq_ti::db::runs::count_runs(&state.db).await.unwrap(), 4);
}

#[tokio::test]
async fn lock_is_reusable_after_failure() {
    let temp_dir = TempDir::new().unwrap();
    let state = test_state(&temp_dir).await;

    let failed: Result<(), ImportError> =
        run_import(&state, RunContext::new("wits", "fanout"), |_| async {
            anyhow::bail!("fetch exploded")
        })
        .await;
    assert!(failed.is_err());

    // The key is free again: a follow-up run succeeds
    let retried = run_import(&state, RunContext::new("wits", "fanout"), |_| async {
        Ok(WorkOutput {
            inserted: 2,
            payload: (),
        })
    })
    .await;
    assert!(retried.is_ok());
    assert_eq!(lcq_ti::db::runs::count_runs(&state.db).await.unwrap(), 2);
}

#[tokio::test]
async fn startup_clears_stale_locks() {
    let temp_dir = TempDir::new().unwrap();
    let state = test_state(&temp_dir).await;

    // Simulate a crashed holder: lock row left behind, no live session
    assert!(AdvisoryLock::acquire(&state.db, "wits:fanout").await.unwrap());

    let cleared = AdvisoryLock::clear_all(&state.db).await.unwrap();
    assert_eq!(cleared, 1);

    let result = run_import(&state, RunContext::new("wits", "fanout"), |_| async {
        Ok(WorkOutput {
            inserted: 0,
            payload: (),
        })
    })
    .await;
    assert!(result.is_ok());
}
