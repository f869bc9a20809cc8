//! Maps raw journal changes to semantic event types by path prefix.
//!
//! The vault's coordination directories (`_jobs/`, `_delegation/`,
//! `_approvals/`, `_system/`) encode workflow state in file lifecycle, so
//! the event type depends on both where the file lives and what happened
//! to it. Anything unrecognized falls through to the generic `file:*`
//! family.

use crate::types::{ChangeEntry, ChangeKind};

/// Semantic event type for a change. Returned as a static string; the set
/// is closed and documented here rather than in an enum so subscription
/// filters can use the same `family:*` wildcard syntax users write.
pub fn classify(change: &ChangeEntry) -> &'static str {
    let path = change.path.as_str();
    let kind = change.kind;

    if let Some(rest) = path.strip_prefix("_jobs/") {
        if rest.starts_with("pending/") {
            return match kind {
                ChangeKind::Create => "job:created",
                ChangeKind::Modify => "job:status-changed",
                ChangeKind::Delete => "job:claimed",
                ChangeKind::Rename => "job:status-changed",
            };
        }
        if rest.starts_with("running/") {
            return match kind {
                ChangeKind::Create => "job:claimed",
                _ => "job:status-changed",
            };
        }
        if rest.starts_with("done/") || rest.starts_with("failed/") {
            return "job:status-changed";
        }
    }

    if let Some(rest) = path.strip_prefix("_delegation/") {
        if rest.starts_with("pending/") {
            return match kind {
                ChangeKind::Create => "task:created",
                ChangeKind::Modify => "task:status-changed",
                ChangeKind::Delete => "task:claimed",
                ChangeKind::Rename => "task:status-changed",
            };
        }
        if rest.starts_with("claimed/") && kind == ChangeKind::Create {
            return "task:claimed";
        }
        if rest.starts_with("completed/") {
            return "task:completed";
        }
    }

    if let Some(rest) = path.strip_prefix("_approvals/") {
        if rest.starts_with("pending/") && kind == ChangeKind::Create {
            return "approval:created";
        }
        if rest.starts_with("resolved/") && kind == ChangeKind::Create {
            return "approval:resolved";
        }
    }

    if path.starts_with("_system/") && kind == ChangeKind::Modify {
        return "system:modified";
    }

    if path.starts_with("Notebooks/") {
        return match kind {
            ChangeKind::Create => "note:created",
            ChangeKind::Modify | ChangeKind::Rename => "note:modified",
            ChangeKind::Delete => "note:deleted",
        };
    }

    match kind {
        ChangeKind::Create => "file:created",
        ChangeKind::Modify => "file:modified",
        ChangeKind::Delete => "file:deleted",
        ChangeKind::Rename => "file:renamed",
    }
}

/// Does an event type match a filter pattern? Patterns are exact
/// (`job:created`), family wildcards (`job:*`), or the global `*`.
pub fn type_matches(event_type: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(family) = pattern.strip_suffix(":*") {
        return event_type
            .split_once(':')
            .is_some_and(|(f, _)| f == family);
    }
    event_type == pattern
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeSource;

    fn change(path: &str, kind: ChangeKind) -> ChangeEntry {
        let mut c = ChangeEntry::deletion(path, ChangeSource::Watcher, "dev");
        c.kind = kind;
        c
    }

    #[test]
    fn job_lifecycle() {
        assert_eq!(classify(&change("_jobs/pending/j1.md", ChangeKind::Create)), "job:created");
        assert_eq!(classify(&change("_jobs/pending/j1.md", ChangeKind::Modify)), "job:status-changed");
        assert_eq!(classify(&change("_jobs/pending/j1.md", ChangeKind::Delete)), "job:claimed");
        assert_eq!(classify(&change("_jobs/running/j1.md", ChangeKind::Create)), "job:claimed");
        assert_eq!(classify(&change("_jobs/running/j1.md", ChangeKind::Modify)), "job:status-changed");
        assert_eq!(classify(&change("_jobs/done/j1.md", ChangeKind::Create)), "job:status-changed");
        assert_eq!(classify(&change("_jobs/failed/j1.md", ChangeKind::Modify)), "job:status-changed");
    }

    #[test]
    fn delegation_mirrors_jobs() {
        assert_eq!(classify(&change("_delegation/pending/t.md", ChangeKind::Create)), "task:created");
        assert_eq!(classify(&change("_delegation/pending/t.md", ChangeKind::Delete)), "task:claimed");
        assert_eq!(classify(&change("_delegation/claimed/t.md", ChangeKind::Create)), "task:claimed");
        assert_eq!(classify(&change("_delegation/completed/t.md", ChangeKind::Create)), "task:completed");
    }

    #[test]
    fn approvals_system_notes() {
        assert_eq!(classify(&change("_approvals/pending/a.md", ChangeKind::Create)), "approval:created");
        assert_eq!(classify(&change("_approvals/resolved/a.md", ChangeKind::Create)), "approval:resolved");
        assert_eq!(classify(&change("_system/config.md", ChangeKind::Modify)), "system:modified");
        assert_eq!(classify(&change("Notebooks/n.md", ChangeKind::Create)), "note:created");
        assert_eq!(classify(&change("Notebooks/n.md", ChangeKind::Delete)), "note:deleted");
    }

    #[test]
    fn fallthrough_is_file_family() {
        assert_eq!(classify(&change("scratch.md", ChangeKind::Create)), "file:created");
        assert_eq!(classify(&change("_system/config.md", ChangeKind::Create)), "file:created");
        assert_eq!(classify(&change("_approvals/pending/a.md", ChangeKind::Modify)), "file:modified");
        assert_eq!(classify(&change("a/b/c.md", ChangeKind::Rename)), "file:renamed");
    }

    #[test]
    fn wildcard_matching() {
        assert!(type_matches("job:created", "*"));
        assert!(type_matches("job:created", "job:*"));
        assert!(type_matches("job:created", "job:created"));
        assert!(!type_matches("job:created", "task:*"));
        assert!(!type_matches("job:created", "job:claimed"));
    }
}
