//! Path filtering: only Markdown is synchronized, and a fixed set of
//! infrastructure paths never leaves the device.

/// Built-in ignore patterns. A path matching any of these (as a substring
/// of the vault-relative path) is invisible to the fabric.
pub const IGNORE_PATTERNS: &[&str] = &[
    ".obsidian/",
    "_embeddings/",
    ".git/",
    ".DS_Store",
    "node_modules/",
    ".sync-conflict-",
    ".trash/",
];

/// True when the vault-relative path is excluded from sync, either by the
/// built-in patterns or by user-configured extras.
pub fn is_ignored(rel_path: &str, extra: &[String]) -> bool {
    IGNORE_PATTERNS.iter().any(|p| rel_path.contains(p))
        || extra.iter().any(|p| !p.is_empty() && rel_path.contains(p.as_str()))
}

/// Only Markdown files are synchronized.
pub fn is_markdown(rel_path: &str) -> bool {
    rel_path.ends_with(".md")
}

/// True when a path should produce change events: Markdown and not ignored.
pub fn is_syncable(rel_path: &str, extra: &[String]) -> bool {
    is_markdown(rel_path) && !is_ignored(rel_path, extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_patterns_cover_infrastructure() {
        let no_extra: &[String] = &[];
        assert!(is_ignored(".obsidian/workspace.json", no_extra));
        assert!(is_ignored("_embeddings/sync.db", no_extra));
        assert!(is_ignored(".git/HEAD", no_extra));
        assert!(is_ignored("sub/.DS_Store", no_extra));
        assert!(is_ignored("node_modules/x/y.md", no_extra));
        assert!(is_ignored("Notebooks/a.sync-conflict-20250101-010101-abcd1234.md", no_extra));
        assert!(is_ignored(".trash/gone.md", no_extra));
        assert!(!is_ignored("Notebooks/a.md", no_extra));
    }

    #[test]
    fn user_extras_apply() {
        let extra = vec!["Private/".to_string()];
        assert!(is_ignored("Private/secret.md", &extra));
        assert!(!is_ignored("Public/open.md", &extra));
    }

    #[test]
    fn only_markdown_is_syncable() {
        let no_extra: &[String] = &[];
        assert!(is_syncable("Notebooks/a.md", no_extra));
        assert!(!is_syncable("Notebooks/a.png", no_extra));
        assert!(!is_syncable("Notebooks/a.md.bak", no_extra));
    }
}
