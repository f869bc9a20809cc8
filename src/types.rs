//! Core data model shared by the journal, the protocol, and the engines.

use serde::{Deserialize, Serialize};

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Modify,
    Delete,
    Rename,
}

/// Which producer observed the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeSource {
    /// Filesystem watcher event.
    Watcher,
    /// Periodic full scan.
    Scan,
    /// Programmatic write through the vault API.
    Api,
    /// Applied from a remote device's delta.
    Remote,
}

/// One record in the append-only journal. Created once, never mutated,
/// compacted after the retention window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEntry {
    /// Journal id, assigned on append. 0 means not yet persisted.
    #[serde(default)]
    pub id: i64,
    /// Vault-relative path, forward slashes.
    pub path: String,
    /// Previous path, renames only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_path: Option<String>,
    pub kind: ChangeKind,
    /// SHA-256 hex of content. None for deletes.
    pub content_hash: Option<String>,
    /// Size in bytes. None for deletes.
    pub size: Option<u64>,
    /// File mtime, epoch milliseconds. None for deletes.
    pub mtime_ms: Option<i64>,
    /// Wall-clock detection time, epoch milliseconds.
    pub detected_at_ms: i64,
    pub source: ChangeSource,
    /// Device where the change originated.
    pub device_id: String,
}

impl ChangeEntry {
    /// A mutation (create/modify) carrying content metadata.
    pub fn mutation(
        path: impl Into<String>,
        kind: ChangeKind,
        content_hash: String,
        size: u64,
        mtime_ms: i64,
        source: ChangeSource,
        device_id: impl Into<String>,
    ) -> Self {
        ChangeEntry {
            id: 0,
            path: path.into(),
            old_path: None,
            kind,
            content_hash: Some(content_hash),
            size: Some(size),
            mtime_ms: Some(mtime_ms),
            detected_at_ms: crate::crypto::epoch_ms(),
            source,
            device_id: device_id.into(),
        }
    }

    /// A delete entry: hash, size and mtime are all null.
    pub fn deletion(
        path: impl Into<String>,
        source: ChangeSource,
        device_id: impl Into<String>,
    ) -> Self {
        ChangeEntry {
            id: 0,
            path: path.into(),
            old_path: None,
            kind: ChangeKind::Delete,
            content_hash: None,
            size: None,
            mtime_ms: None,
            detected_at_ms: crate::crypto::epoch_ms(),
            source,
            device_id: device_id.into(),
        }
    }

    /// A rename entry preserving the prior path.
    pub fn rename(
        old_path: impl Into<String>,
        new_path: impl Into<String>,
        content_hash: Option<String>,
        size: Option<u64>,
        mtime_ms: Option<i64>,
        source: ChangeSource,
        device_id: impl Into<String>,
    ) -> Self {
        ChangeEntry {
            id: 0,
            path: new_path.into(),
            old_path: Some(old_path.into()),
            kind: ChangeKind::Rename,
            content_hash,
            size,
            mtime_ms,
            detected_at_ms: crate::crypto::epoch_ms(),
            source,
            device_id: device_id.into(),
        }
    }
}

/// Per-file version row. The latest version per path is the canonical
/// local state; older rows are retained as history.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionRow {
    pub path: String,
    pub content_hash: String,
    pub size: u64,
    pub mtime_ms: i64,
    /// Monotonic per-file counter.
    pub version: i64,
    pub recorded_at_ms: i64,
    pub device_id: String,
}

/// A device as seen by peers (relay device-list, hello-ack).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_name: String,
}

/// Cursor direction for peer bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerDirection {
    /// Highest change id we have pushed to the peer.
    Sent,
    /// Highest change id we have applied from the peer.
    Received,
}

impl PeerDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            PeerDirection::Sent => "sent",
            PeerDirection::Received => "received",
        }
    }
}

/// How a detected conflict is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    #[default]
    NewerWins,
    /// Reserved for YAML-frontmatter-aware merging; currently behaves like
    /// newer-wins.
    MergeFrontmatter,
    Manual,
}

/// Who resolved a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedBy {
    Auto,
    Manual,
}

/// Which side won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// A recorded divergence between local and remote content for one path.
#[derive(Debug, Clone)]
pub struct ConflictRecord {
    pub id: i64,
    pub path: String,
    pub local_hash: String,
    pub remote_hash: String,
    pub remote_device_id: String,
    pub detected_at_ms: i64,
    pub strategy: ConflictStrategy,
    pub winner: Option<ConflictWinner>,
    pub loser_path: Option<String>,
    pub resolved_at_ms: Option<i64>,
    pub resolved_by: Option<ResolvedBy>,
}
