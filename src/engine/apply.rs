//! Remote delta application.
//!
//! A single worker task applies deltas and catchup batches sequentially,
//! preserving change-id order per originating device. File fetches await
//! inside the worker while the main loop keeps pumping frames, so the
//! matching file-response can always land. Every filesystem or store
//! touch runs on the blocking pool; the worker task itself only awaits.

use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::EngineInner;
use crate::conflict::{ConflictOutcome, LocalState};
use crate::crypto::content_hash;
use crate::detect::{read_file_state, REMOTE_WRITE_SUPPRESS_TTL};
use crate::error::{run_blocking, Result};
use crate::protocol::SyncMessage;
use crate::types::{ChangeEntry, ChangeKind, ChangeSource, PeerDirection};

/// Work items for the apply worker.
pub(crate) enum ApplyJob {
    /// One realtime delta; acked after a successful apply.
    Delta(ChangeEntry),
    /// A catchup batch; advances the last-sync cursor and chains the next
    /// request when the peer has more.
    Batch {
        changes: Vec<ChangeEntry>,
        latest_change_id: i64,
        has_more: bool,
        from_device_id: String,
    },
}

pub(crate) async fn apply_worker(
    inner: Arc<EngineInner>,
    mut rx: mpsc::UnboundedReceiver<ApplyJob>,
) {
    while let Some(job) = rx.recv().await {
        match job {
            ApplyJob::Delta(change) => {
                let id = change.id;
                let device = change.device_id.clone();
                match apply_remote_change(&inner, &change).await {
                    Ok(true) => {
                        let _ = inner
                            .send_message(&SyncMessage::DeltaAck {
                                change_id: id,
                                from_device_id: inner.device_id().to_string(),
                            })
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(change_id = id, from = %device, error = %e, "delta apply failed");
                    }
                }
            }
            ApplyJob::Batch {
                changes,
                latest_change_id,
                has_more,
                from_device_id,
            } => {
                let count = changes.len();
                for change in &changes {
                    if let Err(e) = apply_remote_change(&inner, change).await {
                        warn!(
                            change_id = change.id,
                            path = %change.path,
                            error = %e,
                            "catchup apply failed; continuing batch"
                        );
                    }
                }
                debug!(from = %from_device_id, count, latest_change_id, "catchup batch applied");
                inner.advance_last_sync(latest_change_id).await;
                if has_more {
                    inner.request_next_batch(latest_change_id).await;
                }
            }
        }
    }
}

/// Apply one remote change. Returns Ok(true) when the change was applied
/// (or confirmed already-applied), Ok(false) when it was skipped.
async fn apply_remote_change(inner: &Arc<EngineInner>, change: &ChangeEntry) -> Result<bool> {
    // Echo suppression: our own changes come back via the room broadcast.
    if change.device_id == inner.device_id() {
        return Ok(false);
    }
    if !inner.syncable(&change.path) {
        return Ok(false);
    }

    let applied = match change.kind {
        ChangeKind::Create | ChangeKind::Modify => apply_mutation(inner, change).await?,
        ChangeKind::Delete => {
            let inner = inner.clone();
            let change = change.clone();
            run_blocking(move || apply_delete(&inner, &change)).await?
        }
        ChangeKind::Rename => apply_rename(inner, change).await?,
    };

    if applied {
        let store = inner.store().clone();
        let device = change.device_id.clone();
        let id = change.id;
        let _ = run_blocking(move || {
            store.set_peer_cursor(&device, PeerDirection::Received, id)
        })
        .await;
    }
    Ok(applied)
}

async fn apply_mutation(inner: &Arc<EngineInner>, change: &ChangeEntry) -> Result<bool> {
    let rel = change.path.as_str();
    let remote_hash = change
        .content_hash
        .as_deref()
        .ok_or_else(|| crate::error::SyncError::protocol("mutation without content hash"))?;

    let local = {
        let abs = inner.vault_root().join(rel);
        run_blocking(move || Ok(if abs.is_file() { read_file_state(&abs) } else { None }))
            .await?
    };

    match local {
        // Already identical: converged, nothing to write.
        Some((_, local_hash, size, mtime_ms)) if local_hash == remote_hash => {
            let inner = inner.clone();
            let change = change.clone();
            run_blocking(move || {
                let rel = change.path.as_str();
                let recorded = inner.store().latest_version(rel)?;
                if recorded.map(|v| v.content_hash != local_hash).unwrap_or(true) {
                    inner.store().record_version(
                        rel,
                        &local_hash,
                        size,
                        mtime_ms,
                        &change.device_id,
                    )?;
                }
                inner.cache_insert(rel, local_hash);
                Ok(true)
            })
            .await
        }

        // No local file: fetch and write.
        None => {
            let Some(content) = fetch_content(inner, rel, remote_hash, &change.device_id).await
            else {
                debug!(path = rel, "fetch timed out; apply aborted");
                return Ok(false);
            };
            let inner = inner.clone();
            let change = change.clone();
            run_blocking(move || {
                let rel = change.path.clone();
                write_remote_file(&inner, &rel, &content, &change)?;
                Ok(true)
            })
            .await
        }

        // Divergence: the resolver preserves the loser before anything is
        // overwritten.
        Some((_, local_hash, _, local_mtime)) => {
            let Some(content) = fetch_content(inner, rel, remote_hash, &change.device_id).await
            else {
                debug!(path = rel, "fetch timed out; conflict apply aborted");
                return Ok(false);
            };
            let inner = inner.clone();
            let change = change.clone();
            run_blocking(move || {
                let rel = change.path.clone();
                let local_state = LocalState {
                    content_hash: local_hash,
                    mtime_ms: local_mtime,
                };
                match inner
                    .resolver()
                    .resolve(&rel, &local_state, &change, &content)?
                {
                    ConflictOutcome::ApplyRemote { loser_path } => {
                        write_remote_file(&inner, &rel, &content, &change)?;
                        info!(path = %rel, loser = %loser_path, "remote won conflict");
                    }
                    ConflictOutcome::KeepLocal { loser_path } => {
                        info!(path = %rel, loser = %loser_path, "local won conflict");
                    }
                }
                Ok(true)
            })
            .await
        }
    }
}

/// Deletes apply only when the local file is exactly what we last recorded;
/// a locally-modified file wins over a remote delete (soft conflict).
/// Blocking; runs on the pool.
fn apply_delete(inner: &Arc<EngineInner>, change: &ChangeEntry) -> Result<bool> {
    let rel = change.path.as_str();
    let abs = inner.vault_root().join(rel);
    let tracked = inner.store().latest_version(rel)?;

    if !abs.is_file() {
        // Already gone locally; clean up tracking state if any remains.
        if tracked.is_some() {
            inner.store().remove_versions(rel)?;
            inner.cache_remove(rel);
            record_remote_journal(inner, ChangeEntry::deletion(
                rel,
                ChangeSource::Remote,
                &change.device_id,
            ))?;
        }
        return Ok(true);
    }

    let Some((_, current_hash, _, _)) = read_file_state(&abs) else {
        return Ok(false);
    };
    match tracked {
        Some(v) if v.content_hash == current_hash => {
            inner
                .suppression()
                .suppress(rel, REMOTE_WRITE_SUPPRESS_TTL);
            inner.store().with_lock(rel, "engine", || {
                std::fs::remove_file(&abs)?;
                inner.store().remove_versions(rel)?;
                Ok(())
            })?;
            inner.cache_remove(rel);
            record_remote_journal(inner, ChangeEntry::deletion(
                rel,
                ChangeSource::Remote,
                &change.device_id,
            ))?;
            Ok(true)
        }
        _ => {
            debug!(path = rel, "remote delete skipped; local modifications win");
            Ok(false)
        }
    }
}

async fn apply_rename(inner: &Arc<EngineInner>, change: &ChangeEntry) -> Result<bool> {
    if change.old_path.is_none() {
        // Malformed rename; treat as a plain mutation of the new path.
        return apply_mutation(inner, change).await;
    }

    let moved = {
        let inner = inner.clone();
        let change = change.clone();
        run_blocking(move || try_rename_in_place(&inner, &change)).await?
    };
    match moved {
        Some(applied) => Ok(applied),
        // The source diverged locally (already renamed, edited, or the
        // target exists). Fall back to mutation semantics on the target:
        // the conflict resolver is the safety net.
        None => apply_mutation(inner, change).await,
    }
}

/// In-place move when the source is intact and the target vacant. Returns
/// None when local state diverged and mutation semantics must take over.
/// Blocking; runs on the pool.
fn try_rename_in_place(inner: &Arc<EngineInner>, change: &ChangeEntry) -> Result<Option<bool>> {
    let rel_new = change.path.as_str();
    let Some(rel_old) = change.old_path.as_deref() else {
        return Ok(None);
    };

    let abs_old = inner.vault_root().join(rel_old);
    let abs_new = inner.vault_root().join(rel_new);
    if !abs_old.is_file() || abs_new.exists() {
        return Ok(None);
    }

    inner
        .suppression()
        .suppress(rel_old, REMOTE_WRITE_SUPPRESS_TTL);
    inner
        .suppression()
        .suppress(rel_new, REMOTE_WRITE_SUPPRESS_TTL);
    inner.store().with_lock(rel_new, "engine", || {
        if let Some(parent) = abs_new.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::rename(&abs_old, &abs_new)?;
        inner.store().rename_versions(rel_old, rel_new)?;
        Ok(())
    })?;
    inner.cache_rename(rel_old, rel_new);
    record_remote_journal(inner, ChangeEntry::rename(
        rel_old,
        rel_new,
        change.content_hash.clone(),
        change.size,
        change.mtime_ms,
        ChangeSource::Remote,
        &change.device_id,
    ))?;
    Ok(Some(true))
}

/// Fetch content by (path, hash) from the originating device.
async fn fetch_content(
    inner: &Arc<EngineInner>,
    rel: &str,
    hash: &str,
    target_device: &str,
) -> Option<Vec<u8>> {
    let rx = inner.fetch().register(rel, hash);
    let request = SyncMessage::FileRequest {
        path: rel.to_string(),
        content_hash: hash.to_string(),
        target_device_id: target_device.to_string(),
        from_device_id: inner.device_id().to_string(),
    };
    if let Err(e) = inner.send_message(&request).await {
        debug!(error = %e, "file-request send failed");
        inner.fetch().forget(rel, hash);
        return None;
    }
    let content = inner.fetch().await_content(rel, hash, rx).await?;
    // Verify before trusting: a corrupt or stale response must not land.
    if content_hash(&content) != hash {
        warn!(path = rel, "file-response content hash mismatch; discarded");
        return None;
    }
    Some(content)
}

/// Write remotely-fetched content under suppression and record it.
/// Blocking; runs on the pool.
fn write_remote_file(
    inner: &Arc<EngineInner>,
    rel: &str,
    content: &[u8],
    change: &ChangeEntry,
) -> Result<()> {
    let abs = inner.vault_root().join(rel);
    inner
        .suppression()
        .suppress(rel, REMOTE_WRITE_SUPPRESS_TTL);

    inner.store().with_lock(rel, "engine", || {
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&abs, content)?;
        // Extend the window past the write itself.
        inner
            .suppression()
            .suppress(rel, REMOTE_WRITE_SUPPRESS_TTL);

        let meta = std::fs::metadata(&abs)?;
        let mtime_ms = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let hash = change
            .content_hash
            .clone()
            .unwrap_or_else(|| content_hash(content));
        inner
            .store()
            .record_version(rel, &hash, meta.len(), mtime_ms, &change.device_id)?;
        inner.cache_insert(rel, hash.clone());

        // A rename that fell back to content transfer lands as a modify.
        let kind = match change.kind {
            ChangeKind::Rename => ChangeKind::Modify,
            kind => kind,
        };
        record_remote_journal(
            inner,
            ChangeEntry::mutation(
                rel,
                kind,
                hash,
                meta.len(),
                mtime_ms,
                ChangeSource::Remote,
                &change.device_id,
            ),
        )?;
        Ok(())
    })
}

/// Journal a remote-applied change and wake journal tails. Deliberately
/// not routed through the detector channel: that path publishes deltas,
/// and republishing a remote change would echo it.
fn record_remote_journal(inner: &Arc<EngineInner>, entry: ChangeEntry) -> Result<i64> {
    let id = inner.store().append(&entry)?;
    inner.journal_notify().notify_one();
    Ok(id)
}
