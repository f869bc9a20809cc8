//! In-flight file-request table.
//!
//! Every outstanding fetch parks a oneshot resolver keyed by
//! `path:contentHash`. The first matching file-response wakes it; a 10s
//! timeout returns None and the caller aborts that apply step. Duplicate
//! responses (broadcast delivery) hit an empty slot and are dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;

/// How long a fetch waits for a peer to answer.
pub const FILE_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
pub struct FetchTable {
    pending: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
}

fn fetch_key(path: &str, content_hash: &str) -> String {
    format!("{}:{}", path, content_hash)
}

impl FetchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a resolver for (path, hash). A second request for the same key
    /// replaces the first, whose waiter then times out.
    pub fn register(&self, path: &str, content_hash: &str) -> oneshot::Receiver<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(fetch_key(path, content_hash), tx);
        rx
    }

    /// Wake the parked resolver, if any. Returns false for unmatched or
    /// duplicate responses.
    pub fn resolve(&self, path: &str, content_hash: &str, content: Vec<u8>) -> bool {
        let tx = self
            .pending
            .lock()
            .unwrap()
            .remove(&fetch_key(path, content_hash));
        match tx {
            Some(tx) => tx.send(content).is_ok(),
            None => false,
        }
    }

    /// Drop a parked resolver after a timeout so the table cannot leak.
    pub fn forget(&self, path: &str, content_hash: &str) {
        self.pending
            .lock()
            .unwrap()
            .remove(&fetch_key(path, content_hash));
    }

    /// Wait for the resolver with the standard timeout.
    pub async fn await_content(
        &self,
        path: &str,
        content_hash: &str,
        rx: oneshot::Receiver<Vec<u8>>,
    ) -> Option<Vec<u8>> {
        match tokio::time::timeout(FILE_FETCH_TIMEOUT, rx).await {
            Ok(Ok(content)) => Some(content),
            Ok(Err(_)) => {
                // Sender dropped: replaced or engine shutting down.
                None
            }
            Err(_) => {
                self.forget(path, content_hash);
                None
            }
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_matching_response_wakes_resolver() {
        let table = FetchTable::new();
        let rx = table.register("a.md", "hash1");
        assert!(table.resolve("a.md", "hash1", b"body".to_vec()));
        let content = table.await_content("a.md", "hash1", rx).await;
        assert_eq!(content.as_deref(), Some(b"body".as_ref()));
        assert_eq!(table.pending_count(), 0);
    }

    #[tokio::test]
    async fn duplicate_and_unmatched_responses_are_dropped() {
        let table = FetchTable::new();
        let rx = table.register("a.md", "hash1");
        assert!(!table.resolve("a.md", "other-hash", b"no".to_vec()));
        assert!(table.resolve("a.md", "hash1", b"yes".to_vec()));
        // Duplicate delivery after resolution is harmless.
        assert!(!table.resolve("a.md", "hash1", b"again".to_vec()));
        assert_eq!(
            table.await_content("a.md", "hash1", rx).await.as_deref(),
            Some(b"yes".as_ref())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_returns_none_and_clears_slot() {
        let table = FetchTable::new();
        let rx = table.register("a.md", "hash1");
        let content = table.await_content("a.md", "hash1", rx).await;
        assert!(content.is_none());
        assert_eq!(table.pending_count(), 0);
    }
}
