//! Distributed lock store for cross-process coordination.
//!
//! Provides keyed mutual exclusion backed by the `distributed_locks` table.
//! Any number of processes may share the database; the table is the single
//! source of truth.
//!
//! # Guarantees
//!
//! - At most one unexpired record exists per key. Acquisition is one atomic
//!   upsert that only overwrites an expired row, so two callers can never both
//!   observe success.
//! - Locks are never permanent: a holder that crashes loses the key once its
//!   TTL passes. Expiry is lazy, checked against wall-clock time on access.
//! - Release and refresh require the token handed out by `acquire`, so a
//!   holder that outlived its TTL cannot touch its successor's lock.
//!
//! Losing a race is `Ok(None)` / `Ok(false)`. Only store failures are errors.
//!
//! # State Transition Diagram
//!
//! ```text
//! FREE ─── acquire() ──→ HELD ─── release() / ttl elapsed ──→ FREE
//!                         │
//!                    refresh() ↺
//! ```

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::{future::Future, panic::AssertUnwindSafe, time::Duration};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::{
    db::{chrono_duration, format_timestamp, parse_timestamp},
    Result,
};

/// A lock row as stored in `distributed_locks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The coordination key.
    pub key: String,
    /// Opaque token required for release and refresh.
    pub lock_id: String,
    /// Free-form holder description.
    pub owner: Option<String>,
    /// When the current holder acquired the lock.
    pub acquired_at: DateTime<Utc>,
    /// When the lock lapses unless refreshed.
    pub expires_at: DateTime<Utc>,
    /// Caller-supplied annotation.
    pub metadata: Option<String>,
}

impl LockRecord {
    /// Check if the lock has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Remaining duration until expiry, `None` once expired.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.is_expired(now) {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

/// Returned by a successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHandle {
    /// The coordination key.
    pub key: String,
    /// Token to present to `release` / `refresh`.
    pub lock_id: String,
    pub owner: Option<String>,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Polling schedule for [`LockStore::acquire_with_retry`].
///
/// Attempt `n` (1-based) waits `backoff * n` before trying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

type LockRow = (String, String, Option<String>, String, String, Option<String>);

fn decode_row(row: LockRow) -> Result<LockRecord> {
    let (key, lock_id, owner, acquired_str, expires_str, metadata) = row;
    Ok(LockRecord {
        key,
        lock_id,
        owner,
        acquired_at: parse_timestamp(&acquired_str)?,
        expires_at: parse_timestamp(&expires_str)?,
        metadata,
    })
}

/// Keyed mutual exclusion backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct LockStore {
    db: SqlitePool,
}

impl LockStore {
    /// Create a `LockStore` over an existing pool. Call [`init`](Self::init) once.
    #[must_use]
    pub const fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Get the database pool
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Initialize the locks table.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS distributed_locks (
                lock_key TEXT PRIMARY KEY,
                lock_id TEXT NOT NULL,
                owner TEXT,
                acquired_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                metadata TEXT
            )",
        )
        .execute(&self.db)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_distributed_locks_expires_at
             ON distributed_locks(expires_at)",
        )
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Try to take `key` for `ttl`.
    ///
    /// Returns `None` if another holder has an unexpired claim.
    pub async fn acquire(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
    ) -> Result<Option<LockHandle>> {
        self.acquire_with_metadata(key, owner, ttl, None).await
    }

    /// [`acquire`](Self::acquire), recording `metadata` on the row.
    #[tracing::instrument(skip(self, metadata), level = "debug")]
    pub async fn acquire_with_metadata(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        metadata: Option<&str>,
    ) -> Result<Option<LockHandle>> {
        self.cleanup_expired().await?;

        let now = Utc::now();
        let expires_at = now + chrono_duration(ttl)?;
        let lock_id = Uuid::new_v4().to_string();

        // Overwrites only a row that is already expired at `now`.
        let result = sqlx::query(
            "INSERT INTO distributed_locks (lock_key, lock_id, owner, acquired_at, expires_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(lock_key) DO UPDATE SET
                lock_id = excluded.lock_id,
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at,
                metadata = excluded.metadata
             WHERE distributed_locks.expires_at <= excluded.acquired_at",
        )
        .bind(key)
        .bind(&lock_id)
        .bind(owner)
        .bind(format_timestamp(now))
        .bind(format_timestamp(expires_at))
        .bind(metadata)
        .execute(&self.db)
        .await
        .map_err(|e| {
            tracing::error!(key, "Lock acquisition failed: {e}");
            crate::Error::from(e)
        })?;

        if result.rows_affected() == 0 {
            tracing::debug!(key, "Lock held by another owner");
            return Ok(None);
        }

        tracing::debug!(key, lock_id = %lock_id, "Lock acquired");
        Ok(Some(LockHandle {
            key: key.to_string(),
            lock_id,
            owner: owner.map(str::to_string),
            acquired_at: now,
            expires_at,
        }))
    }

    /// Release `key` if `lock_id` still matches. A mismatch is `false`, not an error.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn release(&self, key: &str, lock_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE lock_key = ? AND lock_id = ?")
            .bind(key)
            .bind(lock_id)
            .execute(&self.db)
            .await?;

        let released = result.rows_affected() > 0;
        if !released {
            tracing::debug!(key, "Release ignored: token does not match current holder");
        }
        Ok(released)
    }

    /// Push the expiry of a still-held lock to `now + ttl`.
    ///
    /// Returns `false` if the lock expired or changed hands.
    #[tracing::instrument(skip(self), level = "debug")]
    pub async fn refresh(&self, key: &str, lock_id: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let new_expires = now + chrono_duration(ttl)?;

        let result = sqlx::query(
            "UPDATE distributed_locks SET expires_at = ?
             WHERE lock_key = ? AND lock_id = ? AND expires_at > ?",
        )
        .bind(format_timestamp(new_expires))
        .bind(key)
        .bind(lock_id)
        .bind(format_timestamp(now))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Run `body` while holding `key`.
    ///
    /// Returns `Ok(None)` without running `body` if the key is taken. The lock
    /// is released on every exit path: normal completion, a panic inside
    /// `body` (released, then the panic resumes) and cancellation of the
    /// returned future (release is spawned onto the runtime).
    pub async fn with_lock<F, Fut, T>(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        body: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce(LockHandle) -> Fut,
        Fut: Future<Output = T>,
    {
        let Some(handle) = self.acquire(key, owner, ttl).await? else {
            return Ok(None);
        };
        let lock_id = handle.lock_id.clone();
        let mut guard = ReleaseGuard::new(self.clone(), key, &lock_id);

        let outcome = AssertUnwindSafe(body(handle)).catch_unwind().await;

        guard.disarm();
        if let Err(e) = self.release(key, &lock_id).await {
            // The row lapses on its own once the TTL passes.
            tracing::error!(key, "Failed to release lock after critical section: {e}");
        }

        match outcome {
            Ok(value) => Ok(Some(value)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Poll [`acquire`](Self::acquire) according to `policy`.
    pub async fn acquire_with_retry(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
        policy: RetryPolicy,
    ) -> Result<Option<LockHandle>> {
        for attempt in 0..=policy.attempts {
            if attempt > 0 {
                tokio::time::sleep(policy.backoff.saturating_mul(attempt)).await;
            }
            if let Some(handle) = self.acquire(key, owner, ttl).await? {
                return Ok(Some(handle));
            }
        }
        Ok(None)
    }

    /// Delete every expired row. Also runs before each acquisition.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM distributed_locks WHERE expires_at <= ?")
            .bind(format_timestamp(Utc::now()))
            .execute(&self.db)
            .await?;

        let removed = result.rows_affected();
        if removed > 0 {
            tracing::debug!(removed, "Swept expired locks");
        }
        Ok(removed)
    }

    /// Current unexpired record for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<LockRecord>> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT lock_key, lock_id, owner, acquired_at, expires_at, metadata
             FROM distributed_locks
             WHERE lock_key = ? AND expires_at > ?",
        )
        .bind(key)
        .bind(format_timestamp(Utc::now()))
        .fetch_optional(&self.db)
        .await?;

        row.map(decode_row).transpose()
    }

    /// Whether `key` currently has an unexpired holder.
    pub async fn is_locked(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Get all active (non-expired) locks, ordered by key.
    pub async fn list_active(&self) -> Result<Vec<LockRecord>> {
        let rows: Vec<LockRow> = sqlx::query_as(
            "SELECT lock_key, lock_id, owner, acquired_at, expires_at, metadata
             FROM distributed_locks
             WHERE expires_at > ?
             ORDER BY lock_key ASC",
        )
        .bind(format_timestamp(Utc::now()))
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }
}

/// Releases a lock from `Drop` when the owning future is cancelled.
struct ReleaseGuard {
    store: LockStore,
    key: String,
    lock_id: String,
    armed: bool,
}

impl ReleaseGuard {
    fn new(store: LockStore, key: &str, lock_id: &str) -> Self {
        Self {
            store,
            key: key.to_string(),
            lock_id: lock_id.to_string(),
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "No runtime to release cancelled lock; it will expire");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let lock_id = std::mem::take(&mut self.lock_id);
        runtime.spawn(async move {
            if let Err(e) = store.release(&key, &lock_id).await {
                tracing::warn!(key = %key, "Failed to release cancelled lock: {e}");
            }
        });
    }
}
