//! Local change engine: filesystem watcher plus periodic safety-net scan.
//!
//! Both producers persist into the same journal; consumers order by change
//! id, never by wall clock. The watcher gives low latency, the scanner
//! catches anything the watcher missed (editor swap-file tricks, events
//! dropped while the process was down).

pub mod ignore;
mod scanner;
mod suppress;
mod watcher;

pub use scanner::{scan_once, ScanStats, Scanner, DEFAULT_SCAN_INTERVAL};
pub use suppress::{SuppressionSet, REMOTE_WRITE_SUPPRESS_TTL};
pub use watcher::{VaultWatcher, WATCH_DEBOUNCE};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};

use crate::crypto::content_hash;
use crate::error::Result;
use crate::store::SyncStore;
use crate::types::ChangeEntry;

/// Everything a change producer needs: where the vault is, where changes
/// go, and who must not hear about them.
pub struct DetectorContext {
    pub vault_root: PathBuf,
    pub store: Arc<SyncStore>,
    pub suppression: Arc<SuppressionSet>,
    pub device_id: String,
    pub extra_ignores: Vec<String>,
    /// Appended entries, ids assigned, for realtime consumers.
    pub changes_tx: mpsc::UnboundedSender<ChangeEntry>,
    /// Signaled after every append so journal tails can wake.
    pub journal_notify: Arc<Notify>,
}

impl DetectorContext {
    /// Vault-relative path with forward slashes, or None for paths outside
    /// the vault root.
    pub fn rel_path(&self, abs: &Path) -> Option<String> {
        let rel = abs.strip_prefix(&self.vault_root).ok()?;
        let s = rel.to_string_lossy().replace('\\', "/");
        if s.is_empty() {
            None
        } else {
            Some(s)
        }
    }

    pub fn abs_path(&self, rel: &str) -> PathBuf {
        self.vault_root.join(rel)
    }

    pub fn syncable(&self, rel: &str) -> bool {
        ignore::is_syncable(rel, &self.extra_ignores)
    }

    /// Append to the journal and fan out to realtime consumers.
    pub fn record(&self, mut change: ChangeEntry) -> Result<i64> {
        let id = self.store.append(&change)?;
        change.id = id;
        // Receiver may be gone during shutdown; the journal row is what counts.
        let _ = self.changes_tx.send(change);
        self.journal_notify.notify_one();
        Ok(id)
    }
}

/// Read a file and return (sha256-hex, size, mtime-ms).
/// Any failure (vanished file, permissions) maps to None: the caller skips
/// the event and the scanner will catch up later.
pub fn read_file_state(abs: &Path) -> Option<(Vec<u8>, String, u64, i64)> {
    let data = std::fs::read(abs).ok()?;
    let meta = std::fs::metadata(abs).ok()?;
    let mtime_ms = meta
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_millis() as i64;
    let hash = content_hash(&data);
    Some((data, hash, meta.len(), mtime_ms))
}

/// The combined change detector. Construction starts both producers;
/// `stop` halts them promptly and is idempotent.
pub struct ChangeDetector {
    watcher: VaultWatcher,
    scanner: Scanner,
}

impl ChangeDetector {
    pub fn start(
        ctx: Arc<DetectorContext>,
        scan_interval: std::time::Duration,
    ) -> Result<Self> {
        let watcher = VaultWatcher::start(ctx.clone())?;
        let scanner = Scanner::start(ctx, scan_interval);
        Ok(ChangeDetector { watcher, scanner })
    }

    pub fn stop(&self) {
        self.watcher.stop();
        self.scanner.stop();
    }
}
