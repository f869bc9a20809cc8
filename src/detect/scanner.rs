//! Periodic full scan: the safety net under the watcher.
//!
//! Walks the vault, reconciles disk against the version store, and appends
//! changes for anything the watcher missed. A cheap mtime+size pre-filter
//! keeps the steady-state scan from hashing every file.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::{ignore, DetectorContext};
use crate::error::Result;
use crate::types::{ChangeEntry, ChangeKind, ChangeSource};

/// Default interval between safety-net scans.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub files_seen: usize,
    pub changes: usize,
    pub deletes: usize,
    pub errors: usize,
}

/// One full reconciliation pass. Blocking; run on a blocking thread from
/// async contexts.
pub fn scan_once(ctx: &DetectorContext) -> Result<ScanStats> {
    let mut stats = ScanStats::default();
    let mut seen: HashSet<String> = HashSet::new();

    let walker = WalkDir::new(&ctx.vault_root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            if !entry.file_type().is_dir() {
                return true;
            }
            // Prune ignored directories so the walk never descends into
            // .git, node_modules, or the state directory itself.
            match ctx.rel_path(entry.path()) {
                Some(rel) => !ignore::is_ignored(&format!("{}/", rel), &ctx.extra_ignores),
                None => true, // the root
            }
        });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "scan: unreadable entry skipped");
                stats.errors += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(rel) = ctx.rel_path(entry.path()) else {
            continue;
        };
        if !ctx.syncable(&rel) {
            continue;
        }
        seen.insert(rel.clone());
        stats.files_seen += 1;

        if ctx.suppression.is_suppressed(&rel) {
            continue;
        }

        if let Err(e) = scan_file(ctx, &rel, &mut stats) {
            // Per-file failure skips only that file.
            debug!(path = %rel, error = %e, "scan: file skipped");
            stats.errors += 1;
        }
    }

    // Anything tracked but no longer on disk is a delete.
    for version in ctx.store.current_versions()? {
        if seen.contains(&version.path) || !ctx.syncable(&version.path) {
            continue;
        }
        if ctx.suppression.is_suppressed(&version.path) {
            continue;
        }
        if ctx.abs_path(&version.path).is_file() {
            continue; // appeared between walk and reconcile
        }
        let rel = version.path.clone();
        let result = ctx.store.with_lock(&rel, "scan", || {
            if ctx.store.latest_version(&rel)?.is_none() {
                return Ok(());
            }
            ctx.store.remove_versions(&rel)?;
            ctx.record(ChangeEntry::deletion(
                &rel,
                ChangeSource::Scan,
                &ctx.device_id,
            ))?;
            Ok(())
        });
        match result {
            Ok(()) => stats.deletes += 1,
            Err(e) => {
                debug!(path = %rel, error = %e, "scan: delete skipped");
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

fn scan_file(ctx: &DetectorContext, rel: &str, stats: &mut ScanStats) -> Result<()> {
    let abs = ctx.abs_path(rel);
    let meta = std::fs::metadata(&abs)?;
    let size = meta.len();
    let mtime_ms = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    // Fast pre-filter: stat data unchanged means content unchanged.
    let latest = ctx.store.latest_version(rel)?;
    if let Some(v) = &latest {
        if v.size == size && v.mtime_ms == mtime_ms {
            return Ok(());
        }
    }

    let Some((_, hash, size, mtime_ms)) = super::read_file_state(&abs) else {
        return Ok(()); // vanished mid-scan
    };

    if let Some(v) = &latest {
        if v.content_hash == hash {
            // Touched but not changed (e.g. mtime-only restore).
            ctx.store.touch_version(rel, size, mtime_ms)?;
            return Ok(());
        }
    }

    ctx.store.with_lock(rel, "scan", || {
        let kind = if latest.is_some() {
            ChangeKind::Modify
        } else {
            ChangeKind::Create
        };
        ctx.store
            .record_version(rel, &hash, size, mtime_ms, &ctx.device_id)?;
        ctx.record(ChangeEntry::mutation(
            rel,
            kind,
            hash,
            size,
            mtime_ms,
            ChangeSource::Scan,
            &ctx.device_id,
        ))?;
        Ok(())
    })?;
    stats.changes += 1;
    Ok(())
}

/// Periodic scan driver. The first pass runs immediately on start so a
/// restarted device reconciles before trusting its watcher.
pub struct Scanner {
    shutdown: watch::Sender<bool>,
}

impl Scanner {
    pub fn start(ctx: Arc<DetectorContext>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let scan_ctx = ctx.clone();
                        let result =
                            tokio::task::spawn_blocking(move || scan_once(&scan_ctx)).await;
                        match result {
                            Ok(Ok(stats)) if stats.changes > 0 || stats.deletes > 0 => {
                                info!(
                                    files = stats.files_seen,
                                    changes = stats.changes,
                                    deletes = stats.deletes,
                                    errors = stats.errors,
                                    "scan pass complete"
                                );
                            }
                            Ok(Ok(stats)) => {
                                debug!(files = stats.files_seen, "scan pass clean");
                            }
                            Ok(Err(e)) => warn!(error = %e, "scan pass failed"),
                            Err(e) => warn!(error = %e, "scan task panicked"),
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Scanner {
            shutdown: shutdown_tx,
        }
    }

    /// Idempotent stop.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::SuppressionSet;
    use crate::store::SyncStore;
    use crate::types::ChangeSource;
    use tokio::sync::{mpsc, Notify};

    fn context(root: &std::path::Path) -> (Arc<DetectorContext>, mpsc::UnboundedReceiver<ChangeEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(DetectorContext {
            vault_root: root.to_path_buf(),
            store: Arc::new(SyncStore::open_in_memory().unwrap()),
            suppression: Arc::new(SuppressionSet::new()),
            device_id: "scanner-test-dev".to_string(),
            extra_ignores: vec![],
            changes_tx: tx,
            journal_notify: Arc::new(Notify::new()),
        });
        (ctx, rx)
    }

    #[test]
    fn first_scan_records_creates_then_goes_quiet() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Notebooks")).unwrap();
        std::fs::write(dir.path().join("Notebooks/a.md"), "x").unwrap();
        std::fs::write(dir.path().join("Notebooks/b.md"), "hello").unwrap();
        std::fs::write(dir.path().join("image.png"), [1, 2, 3]).unwrap();

        let (ctx, _rx) = context(dir.path());

        let stats = scan_once(&ctx).unwrap();
        assert_eq!(stats.files_seen, 2);
        assert_eq!(stats.changes, 2);
        assert_eq!(stats.deletes, 0);

        let changes = ctx.store.after(0, 100).unwrap();
        assert_eq!(changes.len(), 2);
        assert!(changes.iter().all(|c| c.source == ChangeSource::Scan));
        let a = changes.iter().find(|c| c.path == "Notebooks/a.md").unwrap();
        assert_eq!(a.content_hash.as_deref(), Some(crate::crypto::content_hash(b"x").as_str()));
        assert_eq!(a.size, Some(1));

        // Second scan: mtime+size pre-filter keeps everything quiet.
        let stats = scan_once(&ctx).unwrap();
        assert_eq!(stats.changes, 0);
        assert_eq!(stats.deletes, 0);
        assert_eq!(ctx.store.change_count().unwrap(), 2);
    }

    #[test]
    fn scan_detects_modify_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "v1").unwrap();
        std::fs::write(dir.path().join("b.md"), "stays").unwrap();

        let (ctx, _rx) = context(dir.path());
        scan_once(&ctx).unwrap();

        // Content changes; make sure the stat pre-filter sees a difference.
        std::fs::write(dir.path().join("a.md"), "v2 longer").unwrap();
        std::fs::remove_file(dir.path().join("b.md")).unwrap();

        let stats = scan_once(&ctx).unwrap();
        assert_eq!(stats.changes, 1);
        assert_eq!(stats.deletes, 1);

        let changes = ctx.store.after(2, 100).unwrap();
        let modify = changes.iter().find(|c| c.path == "a.md").unwrap();
        assert_eq!(modify.kind, ChangeKind::Modify);
        let delete = changes.iter().find(|c| c.path == "b.md").unwrap();
        assert_eq!(delete.kind, ChangeKind::Delete);
        assert!(delete.content_hash.is_none());
        assert!(ctx.store.latest_version("b.md").unwrap().is_none());
    }

    #[test]
    fn ignored_directories_are_pruned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        std::fs::write(dir.path().join(".git/notes.md"), "x").unwrap();
        std::fs::write(dir.path().join("node_modules/pkg/readme.md"), "x").unwrap();
        std::fs::write(dir.path().join("real.md"), "x").unwrap();

        let (ctx, _rx) = context(dir.path());
        let stats = scan_once(&ctx).unwrap();
        assert_eq!(stats.files_seen, 1);
        assert_eq!(stats.changes, 1);
        assert_eq!(ctx.store.after(0, 10).unwrap()[0].path, "real.md");
    }

    #[test]
    fn suppressed_paths_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.md"), "x").unwrap();

        let (ctx, _rx) = context(dir.path());
        ctx.suppression
            .suppress("a.md", Duration::from_secs(10));
        let stats = scan_once(&ctx).unwrap();
        assert_eq!(stats.changes, 0);
        assert_eq!(ctx.store.change_count().unwrap(), 0);
    }
}
