//! Journal & state store: one SQLite file per vault.
//!
//! Holds the append-only change journal, the per-file version cache, consumer
//! and peer cursors, advisory locks, and conflict records. The database is
//! private to the owning process; other devices see it only through the sync
//! protocol.

mod journal;
mod locks;

pub use locks::DEFAULT_LOCK_TTL_MS;

use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;
use crate::types::{ChangeKind, ChangeSource, ConflictStrategy, ConflictWinner, ResolvedBy};

/// Database location relative to the vault root.
pub const DB_RELATIVE_PATH: &str = "_embeddings/sync.db";

/// SQLite busy timeout. Writers back off rather than erroring while a
/// checkpoint or a competing statement holds the file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS changes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    path           TEXT NOT NULL,
    old_path       TEXT,
    kind           TEXT NOT NULL,
    content_hash   TEXT,
    size           INTEGER,
    mtime_ms       INTEGER,
    detected_at_ms INTEGER NOT NULL,
    source         TEXT NOT NULL,
    device_id      TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_changes_device ON changes(device_id, id);
CREATE INDEX IF NOT EXISTS idx_changes_path ON changes(path);

CREATE TABLE IF NOT EXISTS versions (
    path           TEXT NOT NULL,
    content_hash   TEXT NOT NULL,
    size           INTEGER NOT NULL,
    mtime_ms       INTEGER NOT NULL,
    version        INTEGER NOT NULL,
    recorded_at_ms INTEGER NOT NULL,
    device_id      TEXT NOT NULL,
    PRIMARY KEY (path, version)
);

CREATE TABLE IF NOT EXISTS cursors (
    consumer       TEXT PRIMARY KEY,
    last_change_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS peer_cursors (
    peer_device_id TEXT NOT NULL,
    direction      TEXT NOT NULL,
    last_change_id INTEGER NOT NULL,
    PRIMARY KEY (peer_device_id, direction)
);

CREATE TABLE IF NOT EXISTS locks (
    path           TEXT PRIMARY KEY,
    holder         TEXT NOT NULL,
    acquired_at_ms INTEGER NOT NULL,
    expires_at_ms  INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS conflicts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    path             TEXT NOT NULL,
    local_hash       TEXT NOT NULL,
    remote_hash      TEXT NOT NULL,
    remote_device_id TEXT NOT NULL,
    detected_at_ms   INTEGER NOT NULL,
    strategy         TEXT NOT NULL,
    winner           TEXT,
    loser_path       TEXT,
    resolved_at_ms   INTEGER,
    resolved_by      TEXT
);
";

/// Handle to the vault's state database. Cheap to share behind an `Arc`;
/// all access serializes on the inner connection mutex.
pub struct SyncStore {
    conn: Mutex<Connection>,
}

impl SyncStore {
    /// Open (creating if needed) the store at `<vault>/_embeddings/sync.db`.
    pub fn open_vault(vault_root: &Path) -> Result<Self> {
        let db_path = vault_root.join(DB_RELATIVE_PATH);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(&db_path)
    }

    /// Open a store at an explicit path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL keeps readers unblocked while the journal appends.
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch(SCHEMA)?;
        Ok(SyncStore {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }
}

// ── enum <-> column text ────────────────────────────────────────────────

pub(crate) fn kind_to_str(kind: ChangeKind) -> &'static str {
    match kind {
        ChangeKind::Create => "create",
        ChangeKind::Modify => "modify",
        ChangeKind::Delete => "delete",
        ChangeKind::Rename => "rename",
    }
}

pub(crate) fn kind_from_str(s: &str) -> ChangeKind {
    match s {
        "create" => ChangeKind::Create,
        "modify" => ChangeKind::Modify,
        "delete" => ChangeKind::Delete,
        _ => ChangeKind::Rename,
    }
}

pub(crate) fn source_to_str(source: ChangeSource) -> &'static str {
    match source {
        ChangeSource::Watcher => "watcher",
        ChangeSource::Scan => "scan",
        ChangeSource::Api => "api",
        ChangeSource::Remote => "remote",
    }
}

pub(crate) fn source_from_str(s: &str) -> ChangeSource {
    match s {
        "watcher" => ChangeSource::Watcher,
        "scan" => ChangeSource::Scan,
        "api" => ChangeSource::Api,
        _ => ChangeSource::Remote,
    }
}

pub(crate) fn strategy_to_str(s: ConflictStrategy) -> &'static str {
    match s {
        ConflictStrategy::NewerWins => "newer-wins",
        ConflictStrategy::MergeFrontmatter => "merge-frontmatter",
        ConflictStrategy::Manual => "manual",
    }
}

pub(crate) fn strategy_from_str(s: &str) -> ConflictStrategy {
    match s {
        "merge-frontmatter" => ConflictStrategy::MergeFrontmatter,
        "manual" => ConflictStrategy::Manual,
        _ => ConflictStrategy::NewerWins,
    }
}

pub(crate) fn winner_to_str(w: ConflictWinner) -> &'static str {
    match w {
        ConflictWinner::Local => "local",
        ConflictWinner::Remote => "remote",
    }
}

pub(crate) fn winner_from_str(s: &str) -> ConflictWinner {
    match s {
        "local" => ConflictWinner::Local,
        _ => ConflictWinner::Remote,
    }
}

pub(crate) fn resolved_by_to_str(r: ResolvedBy) -> &'static str {
    match r {
        ResolvedBy::Auto => "auto",
        ResolvedBy::Manual => "manual",
    }
}

pub(crate) fn resolved_by_from_str(s: &str) -> ResolvedBy {
    match s {
        "manual" => ResolvedBy::Manual,
        _ => ResolvedBy::Auto,
    }
}
