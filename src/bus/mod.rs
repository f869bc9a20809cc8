//! Typed event bus over the journal tail.
//!
//! A pump task tails the journal with its own cursor, classifies each
//! change, and dispatches to matching subscriptions. Handlers run
//! best-effort in isolation: a panicking handler is logged and its
//! siblings still fire.

pub mod classify;

pub use classify::{classify, type_matches};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, warn};

use crate::error::{run_blocking, Result};
use crate::store::SyncStore;
use crate::types::ChangeEntry;

/// Cursor name the bus pump uses in the journal store.
const BUS_CURSOR: &str = "event-bus";

/// Batch size for each tail read.
const TAIL_BATCH: usize = 256;

/// Fallback poll interval when no append notification arrives.
const TAIL_POLL: Duration = Duration::from_secs(1);

/// A semantic event delivered to subscribers.
#[derive(Debug, Clone)]
pub struct VaultEvent {
    pub event_type: &'static str,
    pub change: ChangeEntry,
}

/// Subscription filter. Empty/None fields match everything; both fields
/// present must both match.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// Event type patterns: exact, `family:*`, or `*`.
    pub event_types: Option<Vec<String>>,
    /// Vault-relative directory prefixes.
    pub directory_prefixes: Option<Vec<String>>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn types(patterns: &[&str]) -> Self {
        EventFilter {
            event_types: Some(patterns.iter().map(|s| s.to_string()).collect()),
            directory_prefixes: None,
        }
    }

    pub fn matches(&self, event: &VaultEvent) -> bool {
        if let Some(types) = &self.event_types {
            if !types.iter().any(|p| type_matches(event.event_type, p)) {
                return false;
            }
        }
        if let Some(prefixes) = &self.directory_prefixes {
            if !prefixes.iter().any(|p| event.change.path.starts_with(p.as_str())) {
                return false;
            }
        }
        true
    }
}

pub type Handler = Box<dyn Fn(&VaultEvent) + Send + Sync>;

/// Opaque subscription handle; pass back to `unsubscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    filter: EventFilter,
    handler: Handler,
}

/// The bus itself. Cheap to clone via `Arc`; `start` attaches a pump task
/// tailing the journal.
pub struct EventBus {
    subs: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl EventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(EventBus {
            subs: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            shutdown: Mutex::new(None),
        })
    }

    pub fn subscribe(&self, filter: EventFilter, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subs.lock().unwrap().push(Subscription {
            id,
            filter,
            handler,
        });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subs.lock().unwrap().retain(|s| s.id != id);
    }

    /// Dispatch one change to every matching subscription. Each handler is
    /// isolated: a panic is caught and logged, siblings still run.
    pub fn dispatch(&self, change: &ChangeEntry) {
        let event = VaultEvent {
            event_type: classify(change),
            change: change.clone(),
        };
        let subs = self.subs.lock().unwrap();
        for sub in subs.iter() {
            if !sub.filter.matches(&event) {
                continue;
            }
            let outcome =
                std::panic::catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event)));
            if outcome.is_err() {
                error!(
                    event_type = event.event_type,
                    path = %event.change.path,
                    "event handler panicked; continuing with remaining handlers"
                );
            }
        }
    }

    /// Start the journal-tail pump. Wakes on `journal_notify` after each
    /// append, with a poll fallback; processes batches in id order and
    /// advances its cursor after each batch.
    pub fn start(
        self: &Arc<Self>,
        store: Arc<SyncStore>,
        journal_notify: Arc<Notify>,
    ) -> Result<()> {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);

        let bus = self.clone();
        let mut cursor = store.cursor(BUS_CURSOR)?;
        tokio::spawn(async move {
            loop {
                // Tail reads hit SQLite; keep them off the async worker.
                let batch = {
                    let store = store.clone();
                    match run_blocking(move || store.after(cursor, TAIL_BATCH)).await {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(error = %e, "event bus tail read failed");
                            Vec::new()
                        }
                    }
                };

                if batch.is_empty() {
                    tokio::select! {
                        _ = journal_notify.notified() => {}
                        _ = tokio::time::sleep(TAIL_POLL) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    continue;
                }

                for change in &batch {
                    bus.dispatch(change);
                    cursor = change.id;
                }
                let advanced = {
                    let store = store.clone();
                    run_blocking(move || store.update_cursor(BUS_CURSOR, cursor)).await
                };
                if let Err(e) = advanced {
                    warn!(error = %e, "event bus cursor update failed");
                }
            }
        });
        Ok(())
    }

    /// Idempotent stop of the pump task.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().as_ref() {
            let _ = tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, ChangeSource};
    use std::sync::atomic::AtomicUsize;

    fn change(path: &str, kind: ChangeKind) -> ChangeEntry {
        let mut c = ChangeEntry::deletion(path, ChangeSource::Watcher, "dev");
        c.kind = kind;
        c
    }

    #[test]
    fn filters_route_events() {
        let bus = EventBus::new();
        let job_hits = Arc::new(AtomicUsize::new(0));
        let note_hits = Arc::new(AtomicUsize::new(0));
        let all_hits = Arc::new(AtomicUsize::new(0));

        {
            let hits = job_hits.clone();
            bus.subscribe(
                EventFilter::types(&["job:*"]),
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let hits = note_hits.clone();
            bus.subscribe(
                EventFilter {
                    event_types: Some(vec!["note:created".into()]),
                    directory_prefixes: Some(vec!["Notebooks/".into()]),
                },
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        {
            let hits = all_hits.clone();
            bus.subscribe(
                EventFilter::all(),
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        bus.dispatch(&change("_jobs/pending/j.md", ChangeKind::Create));
        bus.dispatch(&change("Notebooks/n.md", ChangeKind::Create));
        bus.dispatch(&change("scratch.md", ChangeKind::Modify));

        assert_eq!(job_hits.load(Ordering::SeqCst), 1);
        assert_eq!(note_hits.load(Ordering::SeqCst), 1);
        assert_eq!(all_hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_handler_does_not_stop_siblings() {
        let bus = EventBus::new();
        let survivor = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventFilter::all(),
            Box::new(|_| panic!("handler bug")),
        );
        {
            let hits = survivor.clone();
            bus.subscribe(
                EventFilter::all(),
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        bus.dispatch(&change("a.md", ChangeKind::Create));
        assert_eq!(survivor.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_removes_handler() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = {
            let hits = hits.clone();
            bus.subscribe(
                EventFilter::all(),
                Box::new(move |_| {
                    hits.fetch_add(1, Ordering::SeqCst);
                }),
            )
        };
        bus.dispatch(&change("a.md", ChangeKind::Create));
        bus.unsubscribe(id);
        bus.dispatch(&change("a.md", ChangeKind::Modify));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pump_tails_journal_in_order() {
        let store = Arc::new(SyncStore::open_in_memory().unwrap());
        let notify = Arc::new(Notify::new());
        let bus = EventBus::new();

        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            bus.subscribe(
                EventFilter::all(),
                Box::new(move |event| {
                    seen.lock().unwrap().push(event.change.id);
                }),
            );
        }
        bus.start(store.clone(), notify.clone()).unwrap();

        for i in 0..5 {
            store
                .append(&change(&format!("{}.md", i), ChangeKind::Create))
                .unwrap();
            notify.notify_one();
        }

        // The pump wakes on notify; give it a moment to drain.
        for _ in 0..50 {
            if seen.lock().unwrap().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        bus.stop();

        let ids = seen.lock().unwrap().clone();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.cursor(BUS_CURSOR).unwrap(), 5);
    }
}
