//! Filesystem watcher with per-path debouncing.
//!
//! Raw notify events are noisy: editors write through temp files, save
//! twice, or emit metadata-only updates. Events are therefore collected
//! into a pending map keyed by vault-relative path and flushed once the
//! path has been quiet for the debounce window. Flushing stats and hashes
//! the file, so consecutive saves collapse into one journal entry.

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::DetectorContext;
use crate::error::Result;
use crate::types::{ChangeEntry, ChangeKind, ChangeSource};

/// Per-path quiet window before an event is flushed to the journal.
pub const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// How often the debounce thread wakes to flush mature entries.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What we believe happened to a path, pending flush.
enum Pending {
    /// Created or modified; flush decides which from the version store.
    Mutate,
    /// Removed from disk.
    Remove,
    /// Moved from `old` to this path.
    Rename { old: String },
}

/// The running watcher. Dropping (or calling `stop`) halts event intake;
/// the debounce thread drains within one poll interval.
pub struct VaultWatcher {
    stop: Arc<AtomicBool>,
    // Held only to keep the OS subscription alive.
    _watcher: RecommendedWatcher,
}

impl VaultWatcher {
    pub fn start(ctx: Arc<DetectorContext>) -> Result<Self> {
        let (event_tx, event_rx) = std::sync::mpsc::channel();
        let mut watcher = RecommendedWatcher::new(event_tx, Config::default())?;
        watcher.watch(&ctx.vault_root, RecursiveMode::Recursive)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        std::thread::Builder::new()
            .name("vault-watcher".to_string())
            .spawn(move || debounce_loop(ctx, event_rx, stop_flag))?;

        Ok(VaultWatcher {
            stop,
            _watcher: watcher,
        })
    }

    /// Idempotent; the debounce thread exits within one poll interval.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn debounce_loop(
    ctx: Arc<DetectorContext>,
    event_rx: std::sync::mpsc::Receiver<notify::Result<notify::Event>>,
    stop: Arc<AtomicBool>,
) {
    let mut pending: HashMap<String, (Pending, Instant)> = HashMap::new();

    while !stop.load(Ordering::Relaxed) {
        match event_rx.recv_timeout(POLL_INTERVAL) {
            Ok(Ok(event)) => ingest(&ctx, event, &mut pending),
            Ok(Err(e)) => {
                // Watcher errors are transient; keep the subscription alive.
                warn!(error = %e, "watcher error");
            }
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
        }

        // Flush entries that have been quiet for the debounce window.
        let now = Instant::now();
        let ready: Vec<String> = pending
            .iter()
            .filter(|(_, (_, since))| now.duration_since(*since) >= WATCH_DEBOUNCE)
            .map(|(path, _)| path.clone())
            .collect();
        for rel in ready {
            if let Some((entry, _)) = pending.remove(&rel) {
                flush(&ctx, &rel, entry);
            }
        }

        ctx.suppression.sweep();
    }
}

/// Translate one notify event into pending entries.
fn ingest(
    ctx: &DetectorContext,
    event: notify::Event,
    pending: &mut HashMap<String, (Pending, Instant)>,
) {
    let now = Instant::now();
    match event.kind {
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            let old = ctx.rel_path(&event.paths[0]);
            let new = ctx.rel_path(&event.paths[1]);
            match (old, new) {
                (Some(old), Some(new)) => {
                    let old_ok = ctx.syncable(&old) && !ctx.suppression.is_suppressed(&old);
                    let new_ok = ctx.syncable(&new) && !ctx.suppression.is_suppressed(&new);
                    if old_ok && new_ok {
                        pending.insert(new, (Pending::Rename { old }, now));
                    } else if old_ok {
                        // Renamed out of sync scope: a delete from our side.
                        pending.insert(old, (Pending::Remove, now));
                    } else if new_ok {
                        pending.insert(new, (Pending::Mutate, now));
                    }
                }
                (Some(old), None) => {
                    if ctx.syncable(&old) && !ctx.suppression.is_suppressed(&old) {
                        pending.insert(old, (Pending::Remove, now));
                    }
                }
                (None, Some(new)) => {
                    if ctx.syncable(&new) && !ctx.suppression.is_suppressed(&new) {
                        pending.insert(new, (Pending::Mutate, now));
                    }
                }
                (None, None) => {}
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            for path in &event.paths {
                if let Some(rel) = ctx.rel_path(path) {
                    if ctx.syncable(&rel) && !ctx.suppression.is_suppressed(&rel) {
                        pending.insert(rel, (Pending::Remove, now));
                    }
                }
            }
        }
        // Create, To-side renames, and content/metadata modifications all
        // resolve the same way: stat and hash at flush time.
        EventKind::Create(_) | EventKind::Modify(_) => {
            for path in &event.paths {
                if let Some(rel) = ctx.rel_path(path) {
                    if ctx.syncable(&rel) && !ctx.suppression.is_suppressed(&rel) {
                        // A Remove followed quickly by a write is a rewrite,
                        // not a delete.
                        pending.insert(rel, (Pending::Mutate, now));
                    }
                }
            }
        }
        _ => {}
    }
}

/// Persist one matured pending entry. Failures here are transient by
/// definition (file vanished, lock contention); the scan pass will catch
/// anything we drop.
fn flush(ctx: &DetectorContext, rel: &str, entry: Pending) {
    // Suppression may have started between ingest and flush.
    if ctx.suppression.is_suppressed(rel) {
        return;
    }
    let result = match entry {
        Pending::Mutate => flush_mutate(ctx, rel),
        Pending::Remove => flush_remove(ctx, rel),
        Pending::Rename { old } => flush_rename(ctx, &old, rel),
    };
    if let Err(e) = result {
        debug!(path = rel, error = %e, "watcher flush skipped");
    }
}

fn flush_mutate(ctx: &DetectorContext, rel: &str) -> Result<()> {
    let abs = ctx.abs_path(rel);
    if !abs.is_file() {
        // Vanished while debouncing; treat as a remove.
        return flush_remove(ctx, rel);
    }
    let Some((_, hash, size, mtime_ms)) = super::read_file_state(&abs) else {
        return Ok(()); // unreadable right now; scanner will retry
    };

    ctx.store.with_lock(rel, "watcher", || {
        let latest = ctx.store.latest_version(rel)?;
        if let Some(v) = &latest {
            if v.content_hash == hash {
                if v.mtime_ms != mtime_ms || v.size != size {
                    ctx.store.touch_version(rel, size, mtime_ms)?;
                }
                return Ok(());
            }
        }
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
            ChangeSource::Watcher,
            &ctx.device_id,
        ))?;
        Ok(())
    })
}

fn flush_remove(ctx: &DetectorContext, rel: &str) -> Result<()> {
    if ctx.abs_path(rel).is_file() {
        // Recreated before the flush: a rewrite, not a delete.
        return flush_mutate(ctx, rel);
    }
    ctx.store.with_lock(rel, "watcher", || {
        if ctx.store.latest_version(rel)?.is_none() {
            return Ok(()); // never tracked; nothing to report
        }
        ctx.store.remove_versions(rel)?;
        ctx.record(ChangeEntry::deletion(
            rel,
            ChangeSource::Watcher,
            &ctx.device_id,
        ))?;
        Ok(())
    })
}

fn flush_rename(ctx: &DetectorContext, old: &str, new: &str) -> Result<()> {
    let abs = ctx.abs_path(new);
    if !abs.is_file() {
        return flush_remove(ctx, old);
    }
    let Some((_, hash, size, mtime_ms)) = super::read_file_state(&abs) else {
        return Ok(());
    };

    ctx.store.with_lock(new, "watcher", || {
        if ctx.store.latest_version(old)?.is_none() {
            // We never tracked the source; this is effectively a create.
            ctx.store
                .record_version(new, &hash, size, mtime_ms, &ctx.device_id)?;
            ctx.record(ChangeEntry::mutation(
                new,
                ChangeKind::Create,
                hash,
                size,
                mtime_ms,
                ChangeSource::Watcher,
                &ctx.device_id,
            ))?;
            return Ok(());
        }

        ctx.store.rename_versions(old, new)?;
        ctx.store
            .record_version(new, &hash, size, mtime_ms, &ctx.device_id)?;
        ctx.record(ChangeEntry::rename(
            old,
            new,
            Some(hash),
            Some(size),
            Some(mtime_ms),
            ChangeSource::Watcher,
            &ctx.device_id,
        ))?;
        Ok(())
    })
}
