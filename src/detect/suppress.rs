//! Suppressed-paths set.
//!
//! When the sync engine applies a remote write it marks the path here
//! first; the watcher consults the set before emitting events so a device
//! never ingests its own remote applies as local changes. Entries expire
//! on a TTL rather than requiring explicit removal, so a crashed apply can
//! never permanently mute a path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How long a remote apply keeps a path suppressed after the write.
/// Long enough to cover editor/OS event latency, short enough that a real
/// local edit right after a sync is still picked up.
pub const REMOTE_WRITE_SUPPRESS_TTL: Duration = Duration::from_secs(2);

#[derive(Default)]
pub struct SuppressionSet {
    inner: Mutex<HashMap<String, Instant>>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Suppress a vault-relative path until `ttl` from now. Re-suppressing
    /// extends the window.
    pub fn suppress(&self, rel_path: &str, ttl: Duration) {
        let mut map = self.inner.lock().unwrap();
        map.insert(rel_path.to_string(), Instant::now() + ttl);
    }

    /// Is the path currently suppressed? Expired entries are swept on the
    /// way out.
    pub fn is_suppressed(&self, rel_path: &str) -> bool {
        let mut map = self.inner.lock().unwrap();
        match map.get(rel_path) {
            Some(expiry) if *expiry > Instant::now() => true,
            Some(_) => {
                map.remove(rel_path);
                false
            }
            None => false,
        }
    }

    /// Drop every expired entry. Called opportunistically by the watcher's
    /// debounce loop so the map never grows unbounded.
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.lock().unwrap().retain(|_, expiry| *expiry > now);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
