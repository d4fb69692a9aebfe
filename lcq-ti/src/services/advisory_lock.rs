//! Database-backed advisory locking
//!
//! Mutual exclusion keyed by `source:job`, backed by a dedicated lock
//! table. `acquire` is non-blocking and returns `false` instead of queuing:
//! the run coordinator treats "already running" as a hard stop, not
//! something to wait for. `release` is idempotent and never raises.

use anyhow::Result;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

/// Stable 64-bit hash of a lock key (first 8 bytes of SHA-256), so keys
/// longer than the integer column width are supported.
pub fn lock_key_hash(key: &str) -> i64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Advisory lock operations
pub struct AdvisoryLock;

impl AdvisoryLock {
    /// Try to acquire the lock for `key`. Returns `false` immediately when
    /// another holder has it.
    pub async fn acquire(pool: &SqlitePool, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO advisory_locks (key_hash, lock_key, holder) VALUES (?, ?, ?)",
        )
        .bind(lock_key_hash(key))
        .bind(key)
        .bind(Uuid::new_v4().to_string())
        .execute(pool)
        .await?;

        let acquired = result.rows_affected() == 1;
        if acquired {
            tracing::debug!(lock_key = %key, "Advisory lock acquired");
        } else {
            tracing::debug!(lock_key = %key, "Advisory lock contended");
        }
        Ok(acquired)
    }

    /// Release the lock for `key`. Idempotent: releasing a lock that was
    /// never held is a no-op. Failures are logged, not raised, so release
    /// can never mask the error that ended the run.
    pub async fn release(pool: &SqlitePool, key: &str) {
        match sqlx::query("DELETE FROM advisory_locks WHERE key_hash = ?")
            .bind(lock_key_hash(key))
            .execute(pool)
            .await
        {
            Ok(_) => tracing::debug!(lock_key = %key, "Advisory lock released"),
            Err(e) => {
                tracing::warn!(lock_key = %key, error = %e, "Failed to release advisory lock")
            }
        }
    }

    /// Reclaim every lock row. Called once at service startup, before any
    /// import is scheduled, to clear locks left behind by a crashed holder.
    pub async fn clear_all(pool: &SqlitePool) -> Result<u64> {
        let result = sqlx::query("DELETE FROM advisory_locks").execute(pool).await?;
        let cleared = result.rows_affected();
        if cleared > 0 {
            tracing::warn!(cleared, "Cleared stale advisory locks from previous session");
        }
        Ok(cleared)
    }
}
