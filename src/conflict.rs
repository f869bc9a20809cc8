//! Conflict detection and resolution.
//!
//! A conflict exists when a remote change arrives for a path whose local
//! content differs from both the incoming hash and anything we previously
//! applied from that peer. Resolution never destroys data: the losing copy
//! is persisted as a `.sync-conflict-` sibling before the winner touches
//! the original path.

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, SyncError};
use crate::store::SyncStore;
use crate::types::{
    ChangeEntry, ConflictRecord, ConflictStrategy, ConflictWinner, ResolvedBy,
};

/// Length of the device-id prefix embedded in conflict file names.
const DEVICE_PREFIX_LEN: usize = 8;

/// What the engine should do after resolution. In every case the loser
/// copy named here is already on disk.
#[derive(Debug, PartialEq)]
pub enum ConflictOutcome {
    /// Write the remote content over the original path; the local copy was
    /// preserved at `loser_path`.
    ApplyRemote { loser_path: String },
    /// Keep the local file untouched; the remote content was preserved at
    /// `loser_path`.
    KeepLocal { loser_path: String },
}

impl ConflictOutcome {
    pub fn loser_path(&self) -> &str {
        match self {
            ConflictOutcome::ApplyRemote { loser_path }
            | ConflictOutcome::KeepLocal { loser_path } => loser_path,
        }
    }
}

/// Deterministic conflict-copy name:
/// `<base>.sync-conflict-YYYYMMDD-HHMMSS-<deviceIdPrefix>.<ext>`, with the
/// timestamp taken from the loser's mtime (UTC) and the prefix from the
/// loser's device id.
pub fn conflict_file_name(rel_path: &str, mtime_ms: i64, device_id: &str) -> String {
    let ts = DateTime::<Utc>::from_timestamp_millis(mtime_ms)
        .map(|dt| dt.format("%Y%m%d-%H%M%S").to_string())
        .unwrap_or_else(|| "00000000-000000".to_string());
    let prefix: String = device_id
        .to_ascii_lowercase()
        .chars()
        .take(DEVICE_PREFIX_LEN)
        .collect();

    let (dir, file) = match rel_path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, rel_path),
    };
    let renamed = match file.rsplit_once('.') {
        Some((base, ext)) if !base.is_empty() => {
            format!("{}.sync-conflict-{}-{}.{}", base, ts, prefix, ext)
        }
        _ => format!("{}.sync-conflict-{}-{}", file, ts, prefix),
    };
    match dir {
        Some(dir) => format!("{}/{}", dir, renamed),
        None => renamed,
    }
}

/// Metadata of the local side of a conflict, captured before resolution.
#[derive(Debug, Clone)]
pub struct LocalState {
    pub content_hash: String,
    pub mtime_ms: i64,
}

pub struct ConflictResolver {
    vault_root: PathBuf,
    store: Arc<SyncStore>,
    strategy: ConflictStrategy,
    local_device_id: String,
}

impl ConflictResolver {
    pub fn new(
        vault_root: PathBuf,
        store: Arc<SyncStore>,
        strategy: ConflictStrategy,
        local_device_id: String,
    ) -> Self {
        ConflictResolver {
            vault_root,
            store,
            strategy,
            local_device_id,
        }
    }

    pub fn strategy(&self) -> ConflictStrategy {
        self.strategy
    }

    /// Resolve a divergence between the local file and an incoming remote
    /// change. Preserves the loser on disk, records the conflict, and tells
    /// the caller which content wins. The caller performs the winner write
    /// (under suppression) so this type never races the watcher.
    pub fn resolve(
        &self,
        rel_path: &str,
        local: &LocalState,
        remote: &ChangeEntry,
        remote_content: &[u8],
    ) -> Result<ConflictOutcome> {
        let remote_hash = remote
            .content_hash
            .clone()
            .ok_or_else(|| SyncError::protocol("conflicting change without content hash"))?;
        let remote_mtime = remote.mtime_ms.unwrap_or(0);

        let remote_wins = match self.strategy {
            // merge-frontmatter is reserved; currently identical to
            // newer-wins.
            ConflictStrategy::NewerWins | ConflictStrategy::MergeFrontmatter => {
                remote_mtime >= local.mtime_ms
            }
            ConflictStrategy::Manual => false,
        };

        let outcome = if remote_wins {
            // Loser is the local file: copy it aside before anyone writes.
            let loser_path =
                conflict_file_name(rel_path, local.mtime_ms, &self.local_device_id);
            let local_bytes = std::fs::read(self.vault_root.join(rel_path))?;
            self.write_loser(&loser_path, &local_bytes)?;
            ConflictOutcome::ApplyRemote { loser_path }
        } else {
            // Loser is the remote content.
            let loser_path = conflict_file_name(rel_path, remote_mtime, &remote.device_id);
            self.write_loser(&loser_path, remote_content)?;
            ConflictOutcome::KeepLocal { loser_path }
        };

        let resolved = self.strategy != ConflictStrategy::Manual;
        let (winner, resolved_at, resolved_by) = if resolved {
            let winner = if remote_wins {
                ConflictWinner::Remote
            } else {
                ConflictWinner::Local
            };
            (Some(winner), Some(crate::crypto::epoch_ms()), Some(ResolvedBy::Auto))
        } else {
            (None, None, None)
        };

        self.store.record_conflict(&ConflictRecord {
            id: 0,
            path: rel_path.to_string(),
            local_hash: local.content_hash.clone(),
            remote_hash,
            remote_device_id: remote.device_id.clone(),
            detected_at_ms: crate::crypto::epoch_ms(),
            strategy: self.strategy,
            winner,
            loser_path: Some(outcome.loser_path().to_string()),
            resolved_at_ms: resolved_at,
            resolved_by,
        })?;

        info!(
            path = rel_path,
            loser = outcome.loser_path(),
            remote_device = %remote.device_id,
            strategy = ?self.strategy,
            "conflict resolved"
        );
        Ok(outcome)
    }

    fn write_loser(&self, rel_path: &str, content: &[u8]) -> Result<()> {
        let abs = self.vault_root.join(rel_path);
        if let Some(parent) = abs.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(abs, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, ChangeSource};

    fn remote_change(path: &str, hash: &str, mtime: i64) -> ChangeEntry {
        ChangeEntry::mutation(
            path,
            ChangeKind::Modify,
            hash.to_string(),
            1,
            mtime,
            ChangeSource::Remote,
            "feedc0dedeadbeef",
        )
    }

    fn resolver(dir: &std::path::Path, strategy: ConflictStrategy) -> ConflictResolver {
        ConflictResolver::new(
            dir.to_path_buf(),
            Arc::new(SyncStore::open_in_memory().unwrap()),
            strategy,
            "0123456789abcdef".to_string(),
        )
    }

    #[test]
    fn conflict_names_are_deterministic() {
        // 2025-03-01 12:30:45 UTC
        let mtime = 1740832245000;
        let name = conflict_file_name("Notebooks/plan.md", mtime, "ABCDEF0123456789");
        assert_eq!(
            name,
            "Notebooks/plan.sync-conflict-20250301-123045-abcdef01.md"
        );
        // Same inputs, same name
        assert_eq!(
            name,
            conflict_file_name("Notebooks/plan.md", mtime, "ABCDEF0123456789")
        );
        // No extension
        let bare = conflict_file_name("README", mtime, "abcdef0123456789");
        assert_eq!(bare, "README.sync-conflict-20250301-123045-abcdef01");
    }

    #[test]
    fn newer_remote_wins_and_local_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.md"), "local body").unwrap();

        let r = resolver(dir.path(), ConflictStrategy::NewerWins);
        let local = LocalState {
            content_hash: crate::crypto::content_hash(b"local body"),
            mtime_ms: 1_000_000,
        };
        let remote = remote_change("n.md", "remotehash", 2_000_000);

        let outcome = r.resolve("n.md", &local, &remote, b"remote body").unwrap();
        let loser_path = match &outcome {
            ConflictOutcome::ApplyRemote { loser_path } => loser_path.clone(),
            other => panic!("expected ApplyRemote, got {:?}", other),
        };
        // Loser copy holds the local body
        let preserved = std::fs::read_to_string(dir.path().join(&loser_path)).unwrap();
        assert_eq!(preserved, "local body");
        assert!(loser_path.contains(".sync-conflict-"));
        // Prefix is the local (losing) device
        assert!(loser_path.ends_with("-01234567.md"));

        // Recorded as auto-resolved with remote winner
        let r2 = r.store.unresolved_conflicts().unwrap();
        assert!(r2.is_empty());
    }

    #[test]
    fn older_remote_loses_and_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.md"), "local body").unwrap();

        let r = resolver(dir.path(), ConflictStrategy::NewerWins);
        let local = LocalState {
            content_hash: crate::crypto::content_hash(b"local body"),
            mtime_ms: 2_000_000,
        };
        let remote = remote_change("n.md", "remotehash", 1_000_000);

        let outcome = r.resolve("n.md", &local, &remote, b"remote body").unwrap();
        let loser_path = match &outcome {
            ConflictOutcome::KeepLocal { loser_path } => loser_path.clone(),
            other => panic!("expected KeepLocal, got {:?}", other),
        };
        assert_eq!(
            std::fs::read_to_string(dir.path().join(&loser_path)).unwrap(),
            "remote body"
        );
        // Local file untouched
        assert_eq!(
            std::fs::read_to_string(dir.path().join("n.md")).unwrap(),
            "local body"
        );
        // Prefix is the remote (losing) device
        assert!(loser_path.ends_with("-feedc0de.md"));
    }

    #[test]
    fn equal_mtime_remote_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.md"), "local").unwrap();
        let r = resolver(dir.path(), ConflictStrategy::NewerWins);
        let local = LocalState {
            content_hash: "l".into(),
            mtime_ms: 5,
        };
        let remote = remote_change("n.md", "r", 5);
        let outcome = r.resolve("n.md", &local, &remote, b"remote").unwrap();
        assert!(matches!(outcome, ConflictOutcome::ApplyRemote { .. }));
    }

    #[test]
    fn manual_strategy_never_overwrites_and_stays_unresolved() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.md"), "local").unwrap();

        let r = resolver(dir.path(), ConflictStrategy::Manual);
        let local = LocalState {
            content_hash: "l".into(),
            mtime_ms: 1,
        };
        // Remote is newer, but manual never applies it
        let remote = remote_change("n.md", "r", 99);
        let outcome = r.resolve("n.md", &local, &remote, b"remote").unwrap();
        assert!(matches!(outcome, ConflictOutcome::KeepLocal { .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("n.md")).unwrap(),
            "local"
        );

        let open = r.store.unresolved_conflicts().unwrap();
        assert_eq!(open.len(), 1);
        assert!(open[0].winner.is_none());
        assert_eq!(open[0].loser_path.as_deref(), Some(outcome.loser_path()));
    }

    #[test]
    fn both_copies_readable_after_resolution() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("n.md"), "A").unwrap();
        let r = resolver(dir.path(), ConflictStrategy::NewerWins);
        let local = LocalState {
            content_hash: crate::crypto::content_hash(b"A"),
            mtime_ms: 10,
        };
        let remote = remote_change("n.md", &crate::crypto::content_hash(b"B"), 20);
        let outcome = r.resolve("n.md", &local, &remote, b"B").unwrap();

        // Caller writes the winner; simulate it.
        std::fs::write(dir.path().join("n.md"), "B").unwrap();

        assert_eq!(
            std::fs::read_to_string(dir.path().join("n.md")).unwrap(),
            "B"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join(outcome.loser_path())).unwrap(),
            "A"
        );
    }
}
