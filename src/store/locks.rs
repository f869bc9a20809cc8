//! Advisory per-path locks with TTL expiry.
//!
//! Locks coordinate writers within the owning process: the watcher, the
//! scanner, and the sync engine all take the path lock before mutating a
//! file or its version rows. At most one unexpired holder exists per path;
//! expired rows are reclaimable by anyone.

use rusqlite::{params, OptionalExtension};

use super::SyncStore;
use crate::crypto::epoch_ms;
use crate::error::{Result, SyncError};

/// Default lock lifetime: 30 seconds.
pub const DEFAULT_LOCK_TTL_MS: i64 = 30_000;

impl SyncStore {
    /// Acquire (or refresh) the lock on `path`. Succeeds when no row
    /// exists, the row has expired, or `holder` already owns it. On
    /// contention the error names the current holder.
    pub fn acquire_lock(&self, path: &str, holder: &str, ttl_ms: i64) -> Result<()> {
        let now = epoch_ms();
        self.with_conn(|conn| {
            let existing: Option<(String, i64)> = conn
                .query_row(
                    "SELECT holder, expires_at_ms FROM locks WHERE path = ?1",
                    params![path],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            if let Some((current, expires_at)) = existing {
                if current != holder && expires_at > now {
                    return Err(SyncError::LockHeld {
                        path: path.to_string(),
                        holder: current,
                    });
                }
            }

            conn.execute(
                "INSERT INTO locks (path, holder, acquired_at_ms, expires_at_ms) \
                 VALUES (?1, ?2, ?3, ?4) \
                 ON CONFLICT(path) DO UPDATE SET \
                   holder = excluded.holder, \
                   acquired_at_ms = excluded.acquired_at_ms, \
                   expires_at_ms = excluded.expires_at_ms",
                params![path, holder, now, now + ttl_ms],
            )?;
            Ok(())
        })
    }

    /// Release the lock if `holder` owns it. Releasing a lock that expired
    /// or was reclaimed is a no-op.
    pub fn release_lock(&self, path: &str, holder: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM locks WHERE path = ?1 AND holder = ?2",
                params![path, holder],
            )?;
            Ok(())
        })
    }

    /// Current unexpired holder for a path, if any.
    pub fn lock_holder(&self, path: &str) -> Result<Option<String>> {
        let now = epoch_ms();
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT holder FROM locks WHERE path = ?1 AND expires_at_ms > ?2",
                    params![path, now],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Run `f` under the path lock; the lock is released on every exit
    /// path, including when `f` fails.
    pub fn with_lock<T>(
        &self,
        path: &str,
        holder: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        self.acquire_lock(path, holder, DEFAULT_LOCK_TTL_MS)?;
        let result = f();
        // Release failure must not mask the callback's own error.
        let released = self.release_lock(path, holder);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), _) => Err(e),
        }
    }
}
