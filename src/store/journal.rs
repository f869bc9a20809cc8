//! Change journal, version cache, cursors, and conflict records.

use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::crypto::epoch_ms;
use crate::error::{Result, SyncError};
use crate::types::{ChangeEntry, ConflictRecord, PeerDirection, VersionRow};

fn change_from_row(row: &Row<'_>) -> rusqlite::Result<ChangeEntry> {
    Ok(ChangeEntry {
        id: row.get(0)?,
        path: row.get(1)?,
        old_path: row.get(2)?,
        kind: kind_from_str(&row.get::<_, String>(3)?),
        content_hash: row.get(4)?,
        size: row.get::<_, Option<i64>>(5)?.map(|s| s as u64),
        mtime_ms: row.get(6)?,
        detected_at_ms: row.get(7)?,
        source: source_from_str(&row.get::<_, String>(8)?),
        device_id: row.get(9)?,
    })
}

const CHANGE_COLUMNS: &str =
    "id, path, old_path, kind, content_hash, size, mtime_ms, detected_at_ms, source, device_id";

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<VersionRow> {
    Ok(VersionRow {
        path: row.get(0)?,
        content_hash: row.get(1)?,
        size: row.get::<_, i64>(2)? as u64,
        mtime_ms: row.get(3)?,
        version: row.get(4)?,
        recorded_at_ms: row.get(5)?,
        device_id: row.get(6)?,
    })
}

impl SyncStore {
    // ── changes ─────────────────────────────────────────────────────────

    /// Append a change, returning the assigned journal id.
    pub fn append(&self, change: &ChangeEntry) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO changes \
                 (path, old_path, kind, content_hash, size, mtime_ms, detected_at_ms, source, device_id) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    change.path,
                    change.old_path,
                    kind_to_str(change.kind),
                    change.content_hash,
                    change.size.map(|s| s as i64),
                    change.mtime_ms,
                    change.detected_at_ms,
                    source_to_str(change.source),
                    change.device_id,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Changes after `cursor`, id-ascending, at most `limit`.
    pub fn after(&self, cursor: i64, limit: usize) -> Result<Vec<ChangeEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM changes WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
                CHANGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![cursor, limit as i64], change_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Changes originating from `local_device` that `peer` has not yet been
    /// sent, per the peer's `sent` cursor.
    pub fn unsynced_changes(
        &self,
        local_device: &str,
        peer: &str,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        let since = self.peer_cursor(peer, PeerDirection::Sent)?;
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM changes \
                 WHERE id > ?1 AND device_id = ?2 ORDER BY id ASC LIMIT ?3",
                CHANGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![since, local_device, limit as i64], change_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Changes originating from one device after an explicit cursor. Used
    /// to answer index requests from catching-up peers.
    pub fn changes_from_device(
        &self,
        device_id: &str,
        since: i64,
        limit: usize,
    ) -> Result<Vec<ChangeEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM changes \
                 WHERE id > ?1 AND device_id = ?2 ORDER BY id ASC LIMIT ?3",
                CHANGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![since, device_id, limit as i64], change_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Highest journal id, 0 when empty.
    pub fn latest_change_id(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(id), 0) FROM changes",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn change_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))?)
        })
    }

    /// Delete entries older than the retention window. Returns the number
    /// of rows removed. Never called automatically; an operator concern.
    pub fn compact(&self, days: u32) -> Result<usize> {
        let cutoff = epoch_ms() - i64::from(days) * 24 * 60 * 60 * 1000;
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM changes WHERE detected_at_ms < ?1",
                params![cutoff],
            )?)
        })
    }

    // ── cursors ─────────────────────────────────────────────────────────

    /// Last-processed change id for a consumer, 0 if never set.
    pub fn cursor(&self, consumer: &str) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_change_id FROM cursors WHERE consumer = ?1",
                    params![consumer],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
    }

    /// Upsert a consumer cursor. Values only increase; a regression is a
    /// caller bug and is rejected.
    pub fn update_cursor(&self, consumer: &str, id: i64) -> Result<()> {
        let current = self.cursor(consumer)?;
        if id < current {
            return Err(SyncError::CursorRegression {
                consumer: consumer.to_string(),
                from: current,
                to: id,
            });
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO cursors (consumer, last_change_id) VALUES (?1, ?2) \
                 ON CONFLICT(consumer) DO UPDATE SET last_change_id = excluded.last_change_id",
                params![consumer, id],
            )?;
            Ok(())
        })
    }

    pub fn peer_cursor(&self, peer: &str, direction: PeerDirection) -> Result<i64> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT last_change_id FROM peer_cursors \
                     WHERE peer_device_id = ?1 AND direction = ?2",
                    params![peer, direction.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0))
        })
    }

    pub fn set_peer_cursor(&self, peer: &str, direction: PeerDirection, id: i64) -> Result<()> {
        let current = self.peer_cursor(peer, direction)?;
        if id < current {
            // Peers may resend old acks after a reconnect; ignore quietly.
            return Ok(());
        }
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO peer_cursors (peer_device_id, direction, last_change_id) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(peer_device_id, direction) \
                 DO UPDATE SET last_change_id = excluded.last_change_id",
                params![peer, direction.as_str(), id],
            )?;
            Ok(())
        })
    }

    // ── versions ────────────────────────────────────────────────────────

    /// Record a new version for a path; the per-file counter advances by
    /// one. Returns the new version number.
    pub fn record_version(
        &self,
        path: &str,
        content_hash: &str,
        size: u64,
        mtime_ms: i64,
        device_id: &str,
    ) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO versions \
                 (path, content_hash, size, mtime_ms, version, recorded_at_ms, device_id) \
                 VALUES (?1, ?2, ?3, ?4, \
                     (SELECT COALESCE(MAX(version), 0) + 1 FROM versions WHERE path = ?1), \
                     ?5, ?6)",
                params![path, content_hash, size as i64, mtime_ms, epoch_ms(), device_id],
            )?;
            Ok(conn.query_row(
                "SELECT MAX(version) FROM versions WHERE path = ?1",
                params![path],
                |row| row.get(0),
            )?)
        })
    }

    /// The canonical local state for a path: its highest-version row.
    pub fn latest_version(&self, path: &str) -> Result<Option<VersionRow>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT path, content_hash, size, mtime_ms, version, recorded_at_ms, device_id \
                     FROM versions WHERE path = ?1 ORDER BY version DESC LIMIT 1",
                    params![path],
                    version_from_row,
                )
                .optional()?)
        })
    }

    /// Latest version row for every known path.
    pub fn current_versions(&self) -> Result<Vec<VersionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT v.path, v.content_hash, v.size, v.mtime_ms, v.version, \
                        v.recorded_at_ms, v.device_id \
                 FROM versions v \
                 JOIN (SELECT path, MAX(version) AS mv FROM versions GROUP BY path) m \
                   ON v.path = m.path AND v.version = m.mv \
                 ORDER BY v.path",
            )?;
            let rows = stmt.query_map([], version_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    /// Refresh size/mtime on the latest row without advancing the version.
    /// Used by the scanner when content is unchanged but stat data moved.
    pub fn touch_version(&self, path: &str, size: u64, mtime_ms: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE versions SET size = ?2, mtime_ms = ?3 \
                 WHERE path = ?1 AND version = (SELECT MAX(version) FROM versions WHERE path = ?1)",
                params![path, size as i64, mtime_ms],
            )?;
            Ok(())
        })
    }

    /// Drop all version rows for a deleted path.
    pub fn remove_versions(&self, path: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM versions WHERE path = ?1", params![path])?;
            Ok(())
        })
    }

    /// Migrate version history across a rename.
    pub fn rename_versions(&self, old_path: &str, new_path: &str) -> Result<()> {
        self.with_conn(|conn| {
            // A previous file at the destination is superseded by the move.
            conn.execute("DELETE FROM versions WHERE path = ?1", params![new_path])?;
            conn.execute(
                "UPDATE versions SET path = ?2 WHERE path = ?1",
                params![old_path, new_path],
            )?;
            Ok(())
        })
    }

    // ── conflicts ───────────────────────────────────────────────────────

    pub fn record_conflict(&self, record: &ConflictRecord) -> Result<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conflicts \
                 (path, local_hash, remote_hash, remote_device_id, detected_at_ms, strategy, \
                  winner, loser_path, resolved_at_ms, resolved_by) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.path,
                    record.local_hash,
                    record.remote_hash,
                    record.remote_device_id,
                    record.detected_at_ms,
                    strategy_to_str(record.strategy),
                    record.winner.map(winner_to_str),
                    record.loser_path,
                    record.resolved_at_ms,
                    record.resolved_by.map(resolved_by_to_str),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Conflicts awaiting a manual decision.
    pub fn unresolved_conflicts(&self) -> Result<Vec<ConflictRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, path, local_hash, remote_hash, remote_device_id, detected_at_ms, \
                        strategy, winner, loser_path, resolved_at_ms, resolved_by \
                 FROM conflicts WHERE resolved_at_ms IS NULL ORDER BY id",
            )?;
            let rows = stmt.query_map([], conflict_from_row)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn mark_conflict_resolved(
        &self,
        id: i64,
        winner: crate::types::ConflictWinner,
        loser_path: Option<&str>,
        resolved_by: crate::types::ResolvedBy,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conflicts SET winner = ?2, loser_path = ?3, \
                 resolved_at_ms = ?4, resolved_by = ?5 WHERE id = ?1",
                params![
                    id,
                    winner_to_str(winner),
                    loser_path,
                    epoch_ms(),
                    resolved_by_to_str(resolved_by),
                ],
            )?;
            Ok(())
        })
    }
}

fn conflict_from_row(row: &Row<'_>) -> rusqlite::Result<ConflictRecord> {
    Ok(ConflictRecord {
        id: row.get(0)?,
        path: row.get(1)?,
        local_hash: row.get(2)?,
        remote_hash: row.get(3)?,
        remote_device_id: row.get(4)?,
        detected_at_ms: row.get(5)?,
        strategy: strategy_from_str(&row.get::<_, String>(6)?),
        winner: row.get::<_, Option<String>>(7)?.map(|s| winner_from_str(&s)),
        loser_path: row.get(8)?,
        resolved_at_ms: row.get(9)?,
        resolved_by: row
            .get::<_, Option<String>>(10)?
            .map(|s| resolved_by_from_str(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, ChangeSource};

    fn change(path: &str, device: &str) -> ChangeEntry {
        ChangeEntry::mutation(
            path,
            ChangeKind::Create,
            "aa".to_string(),
            1,
            1000,
            ChangeSource::Watcher,
            device,
        )
    }

    #[test]
    fn append_assigns_monotone_contiguous_ids() {
        let store = SyncStore::open_in_memory().unwrap();
        let mut last = 0;
        for i in 0..20 {
            let id = store.append(&change(&format!("n{}.md", i), "d1")).unwrap();
            assert_eq!(id, last + 1, "ids must be contiguous");
            last = id;
        }
        assert_eq!(store.latest_change_id().unwrap(), 20);
        assert_eq!(store.change_count().unwrap(), 20);
    }

    #[test]
    fn after_returns_ascending_window() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..10 {
            store.append(&change(&format!("{}.md", i), "d1")).unwrap();
        }
        let batch = store.after(3, 4).unwrap();
        let ids: Vec<i64> = batch.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![4, 5, 6, 7]);
    }

    #[test]
    fn replaying_after_is_idempotent() {
        let store = SyncStore::open_in_memory().unwrap();
        for i in 0..5 {
            store.append(&change(&format!("{}.md", i), "d1")).unwrap();
        }
        let first = store.after(2, 100).unwrap();
        let second = store.after(2, 100).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn cursor_rejects_regression_allows_repeat() {
        let store = SyncStore::open_in_memory().unwrap();
        assert_eq!(store.cursor("bus").unwrap(), 0);
        store.update_cursor("bus", 5).unwrap();
        store.update_cursor("bus", 5).unwrap(); // same value is fine
        store.update_cursor("bus", 9).unwrap();
        let err = store.update_cursor("bus", 4).unwrap_err();
        assert!(matches!(err, SyncError::CursorRegression { .. }));
        assert_eq!(store.cursor("bus").unwrap(), 9);
    }

    #[test]
    fn unsynced_changes_filters_by_origin_and_peer_cursor() {
        let store = SyncStore::open_in_memory().unwrap();
        store.append(&change("a.md", "me")).unwrap(); // 1
        store.append(&change("b.md", "them")).unwrap(); // 2
        store.append(&change("c.md", "me")).unwrap(); // 3
        store.append(&change("d.md", "me")).unwrap(); // 4

        let unsynced = store.unsynced_changes("me", "them", 10).unwrap();
        let paths: Vec<&str> = unsynced.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a.md", "c.md", "d.md"]);

        store
            .set_peer_cursor("them", PeerDirection::Sent, 3)
            .unwrap();
        let unsynced = store.unsynced_changes("me", "them", 10).unwrap();
        let paths: Vec<&str> = unsynced.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["d.md"]);
    }

    #[test]
    fn version_counter_advances_per_file() {
        let store = SyncStore::open_in_memory().unwrap();
        assert_eq!(store.record_version("a.md", "h1", 1, 10, "d").unwrap(), 1);
        assert_eq!(store.record_version("a.md", "h2", 2, 20, "d").unwrap(), 2);
        assert_eq!(store.record_version("b.md", "h1", 1, 10, "d").unwrap(), 1);

        let latest = store.latest_version("a.md").unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content_hash, "h2");

        let current = store.current_versions().unwrap();
        assert_eq!(current.len(), 2);
    }

    #[test]
    fn rename_migrates_history_and_supersedes_target() {
        let store = SyncStore::open_in_memory().unwrap();
        store.record_version("old.md", "h1", 1, 10, "d").unwrap();
        store.record_version("old.md", "h2", 2, 20, "d").unwrap();
        store.record_version("new.md", "hx", 9, 90, "d").unwrap();

        store.rename_versions("old.md", "new.md").unwrap();
        assert!(store.latest_version("old.md").unwrap().is_none());
        let latest = store.latest_version("new.md").unwrap().unwrap();
        assert_eq!(latest.content_hash, "h2");
        assert_eq!(latest.version, 2);
    }

    #[test]
    fn compact_removes_old_entries() {
        let store = SyncStore::open_in_memory().unwrap();
        let mut old = change("old.md", "d1");
        old.detected_at_ms = epoch_ms() - 40 * 24 * 60 * 60 * 1000;
        store.append(&old).unwrap();
        store.append(&change("new.md", "d1")).unwrap();

        let removed = store.compact(30).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.change_count().unwrap(), 1);
        assert_eq!(store.after(0, 10).unwrap()[0].path, "new.md");
    }

    #[test]
    fn conflict_record_round_trip() {
        let store = SyncStore::open_in_memory().unwrap();
        let id = store
            .record_conflict(&ConflictRecord {
                id: 0,
                path: "n.md".into(),
                local_hash: "l".into(),
                remote_hash: "r".into(),
                remote_device_id: "dev2".into(),
                detected_at_ms: 1,
                strategy: crate::types::ConflictStrategy::Manual,
                winner: None,
                loser_path: None,
                resolved_at_ms: None,
                resolved_by: None,
            })
            .unwrap();

        let open = store.unresolved_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].path, "n.md");

        store
            .mark_conflict_resolved(
                id,
                crate::types::ConflictWinner::Remote,
                Some("n.sync-conflict-x.md"),
                crate::types::ResolvedBy::Manual,
            )
            .unwrap();
        assert!(store.unresolved_conflicts().unwrap().is_empty());
    }
}
