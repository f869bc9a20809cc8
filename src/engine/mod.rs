//! Client sync engine.
//!
//! Owns the relay transport, the local hash cache, the offline outbound
//! queue, and the in-flight fetch table. Local changes flow from the
//! detector to the relay; remote deltas flow through the apply worker,
//! which writes files under suppression so the watcher never echoes them.

mod apply;
mod fetch;
mod transport;

pub use fetch::{FetchTable, FILE_FETCH_TIMEOUT};
pub use transport::{Transport, TransportEvent};

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::conflict::ConflictResolver;
use crate::crypto::{self, VaultKey};
use crate::detect::{self, ChangeDetector, DetectorContext, SuppressionSet};
use crate::error::{run_blocking, Result, SyncError};
use crate::protocol::{self, ErrorCode, SyncMessage};
use crate::store::SyncStore;
use crate::types::{ChangeEntry, ChangeKind, ConflictStrategy, DeviceInfo, PeerDirection};

/// Protocol-level keepalive interval.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// How long the handshake may stay unanswered before redialing.
const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
/// How many pings may go unanswered before the link is declared dead.
const MISSED_PONGS: u32 = 3;
/// Outbound queue bound while disconnected; oldest entries are evicted.
const OFFLINE_QUEUE_CAP: usize = 1000;
/// Catchup batch size for index responses.
const CATCHUP_BATCH: usize = 500;
/// Cursor tracking the highest remote change id applied via catchup.
const LAST_SYNC_CURSOR: &str = "last-sync";
/// Stored relay token, relative to the vault root.
const TOKEN_RELATIVE_PATH: &str = "_embeddings/relay.token";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub vault_root: PathBuf,
    pub relay_url: String,
    pub device_name: String,
    /// Shared vault passphrase; the derived key defines the vault identity.
    pub passphrase: String,
    /// Seal payloads end-to-end. The vault id is derived either way; with
    /// this off the relay sees plaintext frames (trusted-relay setups).
    pub e2e: bool,
    pub strategy: ConflictStrategy,
    pub extra_ignores: Vec<String>,
    pub scan_interval: Duration,
}

impl EngineConfig {
    pub fn new(vault_root: PathBuf, relay_url: String, passphrase: String) -> Self {
        EngineConfig {
            vault_root,
            relay_url,
            device_name: String::new(),
            passphrase,
            e2e: true,
            strategy: ConflictStrategy::NewerWins,
            extra_ignores: Vec::new(),
            scan_interval: detect::DEFAULT_SCAN_INTERVAL,
        }
    }
}

pub(crate) struct EngineInner {
    vault_root: PathBuf,
    device_id: String,
    device_name: String,
    vault_id: String,
    key: Option<VaultKey>,
    store: Arc<SyncStore>,
    suppression: Arc<SuppressionSet>,
    resolver: ConflictResolver,
    transport: Transport,
    fetch: FetchTable,
    hash_cache: Mutex<HashMap<String, String>>,
    offline: Mutex<VecDeque<SyncMessage>>,
    peers: Mutex<Vec<DeviceInfo>>,
    connected: AtomicBool,
    /// Bumped on every fresh connection so stale hello timers can tell
    /// they outlived their connection.
    conn_epoch: AtomicI64,
    last_pong_ms: AtomicI64,
    token_path: PathBuf,
    extra_ignores: Vec<String>,
    journal_notify: Arc<Notify>,
}

/// The running engine. `start` wires everything; `stop` unwinds it.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    detector: ChangeDetector,
}

impl SyncEngine {
    pub async fn start(cfg: EngineConfig) -> Result<SyncEngine> {
        if !cfg.vault_root.is_dir() {
            return Err(SyncError::VaultMissing(cfg.vault_root.clone()));
        }

        let key = crypto::derive_key(&cfg.passphrase);
        let vault_id = crypto::vault_id(&key);
        let device_id = crypto::local_device_id(&cfg.vault_root);
        let device_name = if cfg.device_name.is_empty() {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| device_id.clone())
        } else {
            cfg.device_name.clone()
        };

        let store = Arc::new(SyncStore::open_vault(&cfg.vault_root)?);
        let suppression = Arc::new(SuppressionSet::new());
        let journal_notify = Arc::new(Notify::new());

        // Prime the hash cache from the canonical version rows.
        let mut cache = HashMap::new();
        for version in store.current_versions()? {
            cache.insert(version.path, version.content_hash);
        }

        let resolver = ConflictResolver::new(
            cfg.vault_root.clone(),
            store.clone(),
            cfg.strategy,
            device_id.clone(),
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport = Transport::start(cfg.relay_url.clone(), event_tx);

        let inner = Arc::new(EngineInner {
            vault_root: cfg.vault_root.clone(),
            device_id: device_id.clone(),
            device_name,
            vault_id,
            key: cfg.e2e.then_some(key),
            store: store.clone(),
            suppression: suppression.clone(),
            resolver,
            transport,
            fetch: FetchTable::new(),
            hash_cache: Mutex::new(cache),
            offline: Mutex::new(VecDeque::new()),
            peers: Mutex::new(Vec::new()),
            connected: AtomicBool::new(false),
            conn_epoch: AtomicI64::new(0),
            last_pong_ms: AtomicI64::new(0),
            token_path: cfg.vault_root.join(TOKEN_RELATIVE_PATH),
            extra_ignores: cfg.extra_ignores.clone(),
            journal_notify: journal_notify.clone(),
        });

        // Change detector feeds local changes into the engine loop.
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        let detector_ctx = Arc::new(DetectorContext {
            vault_root: cfg.vault_root.clone(),
            store,
            suppression,
            device_id,
            extra_ignores: cfg.extra_ignores,
            changes_tx,
            journal_notify,
        });
        let detector = ChangeDetector::start(detector_ctx, cfg.scan_interval)?;

        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        tokio::spawn(apply::apply_worker(inner.clone(), apply_rx));
        tokio::spawn(main_loop(inner.clone(), event_rx, changes_rx, apply_tx));

        Ok(SyncEngine { inner, detector })
    }

    /// Stop producers and the transport. Idempotent; outstanding fetches
    /// time out on their own.
    pub async fn stop(&self) {
        self.detector.stop();
        self.inner.transport.stop().await;
        info!(device = %self.inner.device_id, "sync engine stopped");
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn vault_id(&self) -> &str {
        &self.inner.vault_id
    }

    pub fn store(&self) -> &Arc<SyncStore> {
        &self.inner.store
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Other devices currently in our vault room, per the last roster.
    pub fn connected_peers(&self) -> Vec<DeviceInfo> {
        self.inner.peers.lock().unwrap().clone()
    }

    /// Cached content hash for a vault-relative path.
    pub fn local_hash(&self, rel_path: &str) -> Option<String> {
        self.inner.hash_cache.lock().unwrap().get(rel_path).cloned()
    }

    /// Notify handle journal tails (event bus) can wait on.
    pub fn journal_notify(&self) -> Arc<Notify> {
        self.inner.journal_notify.clone()
    }

    /// Introduce a new device to the vault group: hashes the code shown on
    /// the new device and asks the room to approve it.
    pub async fn request_pairing(
        &self,
        new_device_id: &str,
        new_device_name: &str,
        pairing_code: &str,
    ) -> Result<()> {
        self.inner
            .send_message(&SyncMessage::PairRequest {
                device_id: new_device_id.to_string(),
                device_name: new_device_name.to_string(),
                pairing_code_hash: crypto::hash_pairing_code(pairing_code),
            })
            .await
    }

    pub async fn confirm_pairing(&self, device_id: &str, approved: bool) -> Result<()> {
        self.inner
            .send_message(&SyncMessage::PairConfirm {
                device_id: device_id.to_string(),
                approved,
            })
            .await
    }
}

async fn main_loop(
    inner: Arc<EngineInner>,
    mut event_rx: mpsc::UnboundedReceiver<TransportEvent>,
    mut changes_rx: mpsc::UnboundedReceiver<ChangeEntry>,
    apply_tx: mpsc::UnboundedSender<apply::ApplyJob>,
) {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await; // the first tick fires immediately; skip it
    let mut detector_alive = true;

    loop {
        tokio::select! {
            event = event_rx.recv() => match event {
                None => break, // transport stopped
                Some(TransportEvent::Connected) => {
                    inner.on_connected().await;
                    // The hello must be acknowledged promptly; otherwise
                    // drop the link and let backoff take over.
                    let epoch = inner.conn_epoch.load(Ordering::Relaxed);
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(HELLO_TIMEOUT).await;
                        if inner.conn_epoch.load(Ordering::Relaxed) == epoch
                            && !inner.connected.load(Ordering::Relaxed)
                        {
                            warn!("hello not acknowledged in time; reconnecting");
                            inner.transport.force_reconnect().await;
                        }
                    });
                }
                Some(TransportEvent::Disconnected) => {
                    inner.connected.store(false, Ordering::Relaxed);
                }
                Some(TransportEvent::Frame(text)) => {
                    inner.handle_frame(&text, &apply_tx).await;
                }
            },
            change = changes_rx.recv(), if detector_alive => match change {
                None => detector_alive = false,
                Some(change) => inner.handle_local_change(change).await,
            },
            _ = ping.tick() => inner.ping_tick().await,
        }
    }
}

impl EngineInner {
    fn syncable(&self, rel: &str) -> bool {
        detect::ignore::is_syncable(rel, &self.extra_ignores)
    }

    pub(crate) fn vault_root(&self) -> &PathBuf {
        &self.vault_root
    }

    pub(crate) fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn store(&self) -> &Arc<SyncStore> {
        &self.store
    }

    pub(crate) fn suppression(&self) -> &Arc<SuppressionSet> {
        &self.suppression
    }

    pub(crate) fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    pub(crate) fn fetch(&self) -> &FetchTable {
        &self.fetch
    }

    pub(crate) fn journal_notify(&self) -> &Arc<Notify> {
        &self.journal_notify
    }

    pub(crate) fn cache_insert(&self, rel: &str, hash: String) {
        self.hash_cache.lock().unwrap().insert(rel.to_string(), hash);
    }

    pub(crate) fn cache_remove(&self, rel: &str) {
        self.hash_cache.lock().unwrap().remove(rel);
    }

    pub(crate) fn cache_rename(&self, old: &str, new: &str) {
        let mut cache = self.hash_cache.lock().unwrap();
        if let Some(hash) = cache.remove(old) {
            cache.insert(new.to_string(), hash);
        }
    }

    /// Encode (sealing when configured) and transmit one message.
    pub(crate) async fn send_message(&self, msg: &SyncMessage) -> Result<()> {
        let frame = protocol::encode_frame(msg, self.key.as_ref())?;
        self.transport.send(frame).await
    }

    async fn on_connected(&self) {
        self.conn_epoch.fetch_add(1, Ordering::Relaxed);
        self.last_pong_ms
            .store(crypto::epoch_ms(), Ordering::Relaxed);
        let hello = SyncMessage::Hello {
            device_id: self.device_id.clone(),
            device_name: self.device_name.clone(),
            vault_id: self.vault_id.clone(),
            device_token: self.load_token().await,
        };
        if let Err(e) = self.send_message(&hello).await {
            warn!(error = %e, "hello send failed");
        }
    }

    async fn ping_tick(&self) {
        if !self.connected.load(Ordering::Relaxed) {
            return;
        }
        let now = crypto::epoch_ms();
        let last = self.last_pong_ms.load(Ordering::Relaxed);
        if now - last > (PING_INTERVAL.as_millis() as i64) * i64::from(MISSED_PONGS) {
            warn!("no pong for {} intervals; reconnecting", MISSED_PONGS);
            self.connected.store(false, Ordering::Relaxed);
            self.transport.force_reconnect().await;
            return;
        }
        let _ = self
            .send_message(&SyncMessage::Ping { timestamp: now })
            .await;
    }

    /// A local change from the detector: track it and push (or queue) the
    /// delta.
    async fn handle_local_change(&self, change: ChangeEntry) {
        match change.kind {
            ChangeKind::Create | ChangeKind::Modify => {
                if let Some(hash) = &change.content_hash {
                    self.cache_insert(&change.path, hash.clone());
                }
            }
            ChangeKind::Delete => self.cache_remove(&change.path),
            ChangeKind::Rename => {
                if let Some(old) = &change.old_path {
                    self.cache_rename(old, &change.path);
                }
                if let Some(hash) = &change.content_hash {
                    self.cache_insert(&change.path, hash.clone());
                }
            }
        }

        let msg = SyncMessage::DeltaPush { change };
        if self.connected.load(Ordering::Relaxed) {
            match self.send_message(&msg).await {
                Ok(()) => return,
                Err(SyncError::Closed) => {}
                Err(e) => {
                    warn!(error = %e, "delta push failed; queueing");
                }
            }
        }
        self.enqueue_offline(msg);
    }

    fn enqueue_offline(&self, msg: SyncMessage) {
        let mut queue = self.offline.lock().unwrap();
        if queue.len() >= OFFLINE_QUEUE_CAP {
            queue.pop_front();
        }
        queue.push_back(msg);
    }

    /// Push everything queued while offline, oldest first. On a send
    /// failure the message goes back to the front for the next reconnect.
    async fn drain_offline(&self) {
        loop {
            let msg = {
                let mut queue = self.offline.lock().unwrap();
                match queue.pop_front() {
                    Some(msg) => msg,
                    None => break,
                }
            };
            if let Err(e) = self.send_message(&msg).await {
                debug!(error = %e, "offline drain interrupted");
                self.offline.lock().unwrap().push_front(msg);
                break;
            }
        }
    }

    async fn handle_frame(&self, text: &str, apply_tx: &mpsc::UnboundedSender<apply::ApplyJob>) {
        let msg = match protocol::decode_frame(text, self.key.as_ref()) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        match msg {
            SyncMessage::HelloAck {
                assigned_token,
                connected_devices,
                server_version,
            } => {
                debug!(server = %server_version, peers = connected_devices.len(), "hello-ack");
                self.save_token(assigned_token).await;
                *self.peers.lock().unwrap() = connected_devices;
                self.connected.store(true, Ordering::Relaxed);
                self.last_pong_ms
                    .store(crypto::epoch_ms(), Ordering::Relaxed);

                self.drain_offline().await;

                let store = self.store.clone();
                let since = run_blocking(move || store.cursor(LAST_SYNC_CURSOR))
                    .await
                    .unwrap_or(0);
                let _ = self
                    .send_message(&SyncMessage::IndexRequest {
                        since_change_id: since,
                        from_device_id: self.device_id.clone(),
                    })
                    .await;
            }

            SyncMessage::DeviceList { devices } => {
                *self.peers.lock().unwrap() = devices
                    .into_iter()
                    .filter(|d| d.device_id != self.device_id)
                    .collect();
            }

            SyncMessage::Pong { .. } => {
                self.last_pong_ms
                    .store(crypto::epoch_ms(), Ordering::Relaxed);
            }

            SyncMessage::Ping { timestamp } => {
                let _ = self
                    .send_message(&SyncMessage::Pong { timestamp })
                    .await;
            }

            SyncMessage::Error { code, message } => {
                warn!(?code, %message, "relay error");
                if code == ErrorCode::AuthFailed {
                    self.clear_token().await;
                }
            }

            SyncMessage::DeltaAck {
                change_id,
                from_device_id,
            } => {
                if from_device_id != self.device_id {
                    let store = self.store.clone();
                    let _ = run_blocking(move || {
                        store.set_peer_cursor(&from_device_id, PeerDirection::Sent, change_id)
                    })
                    .await;
                }
            }

            SyncMessage::FileResponse {
                path,
                content_hash,
                content,
                ..
            } => {
                if let Some(b64) = content {
                    use base64::{engine::general_purpose::STANDARD, Engine};
                    match STANDARD.decode(b64.as_bytes()) {
                        Ok(bytes) => {
                            self.fetch.resolve(&path, &content_hash, bytes);
                        }
                        Err(e) => debug!(error = %e, "bad file-response encoding"),
                    }
                }
            }

            SyncMessage::FileRequest {
                path,
                content_hash,
                from_device_id,
                ..
            } => {
                // Any device holding matching content may answer; in E2E
                // mode the relay broadcasts the request room-wide anyway.
                if from_device_id != self.device_id {
                    self.answer_file_request(&path, &content_hash).await;
                }
            }

            SyncMessage::DeltaPush { change } => {
                let _ = apply_tx.send(apply::ApplyJob::Delta(change));
            }

            SyncMessage::IndexResponse {
                changes,
                latest_change_id,
                has_more,
                from_device_id,
            } => {
                let _ = apply_tx.send(apply::ApplyJob::Batch {
                    changes,
                    latest_change_id,
                    has_more,
                    from_device_id,
                });
            }

            SyncMessage::IndexRequest {
                since_change_id,
                from_device_id,
            } => {
                if from_device_id != self.device_id {
                    self.answer_index_request(since_change_id).await;
                }
            }

            // Pairing confirmations surface through the relay's device
            // registry; hello frames from peers are relay-internal.
            SyncMessage::Hello { .. }
            | SyncMessage::PairRequest { .. }
            | SyncMessage::PairConfirm { .. } => {}
        }
    }

    /// Serve our own journal tail to a catching-up peer.
    async fn answer_index_request(&self, since: i64) {
        let query = {
            let store = self.store.clone();
            let device_id = self.device_id.clone();
            run_blocking(move || store.changes_from_device(&device_id, since, CATCHUP_BATCH + 1))
                .await
        };
        let mut changes = match query {
            Ok(changes) => changes,
            Err(e) => {
                warn!(error = %e, "index-request query failed");
                return;
            }
        };
        if changes.is_empty() {
            return;
        }
        let has_more = changes.len() > CATCHUP_BATCH;
        changes.truncate(CATCHUP_BATCH);
        let latest_change_id = changes.last().map(|c| c.id).unwrap_or(since);

        let _ = self
            .send_message(&SyncMessage::IndexResponse {
                changes,
                latest_change_id,
                has_more,
                from_device_id: self.device_id.clone(),
            })
            .await;
    }

    /// Answer a fetch if (and only if) our current content matches the
    /// requested hash. No reply otherwise; the requester's timeout covers
    /// the miss so a stale responder can never shadow a good one.
    async fn answer_file_request(&self, rel: &str, wanted_hash: &str) {
        if !self.syncable(rel) {
            return;
        }
        let abs = self.vault_root.join(rel);
        let state = run_blocking(move || Ok(detect::read_file_state(&abs))).await;
        let Some((bytes, hash, _, _)) = state.ok().flatten() else {
            return;
        };
        if hash != wanted_hash {
            debug!(path = rel, "file-request hash mismatch; not answering");
            return;
        }
        use base64::{engine::general_purpose::STANDARD, Engine};
        let _ = self
            .send_message(&SyncMessage::FileResponse {
                path: rel.to_string(),
                content_hash: hash,
                content: Some(STANDARD.encode(&bytes)),
                from_device_id: self.device_id.clone(),
            })
            .await;
    }

    /// Advance the catchup cursor, tolerating out-of-order batches from
    /// multiple peers.
    pub(crate) async fn advance_last_sync(&self, latest: i64) {
        let store = self.store.clone();
        let result = run_blocking(move || {
            let current = store.cursor(LAST_SYNC_CURSOR)?;
            if latest > current {
                store.update_cursor(LAST_SYNC_CURSOR, latest)?;
            }
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "last-sync cursor update failed");
        }
    }

    pub(crate) async fn request_next_batch(&self, since: i64) {
        let _ = self
            .send_message(&SyncMessage::IndexRequest {
                since_change_id: since,
                from_device_id: self.device_id.clone(),
            })
            .await;
    }

    // ── token persistence ───────────────────────────────────────────────

    async fn load_token(&self) -> Option<String> {
        let path = self.token_path.clone();
        run_blocking(move || {
            let token = match std::fs::read_to_string(&path) {
                Ok(token) => token,
                Err(_) => return Ok(None),
            };
            let token = token.trim().to_string();
            Ok(if token.is_empty() { None } else { Some(token) })
        })
        .await
        .ok()
        .flatten()
    }

    async fn save_token(&self, token: String) {
        let path = self.token_path.clone();
        let result = run_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, token)?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "token persistence failed");
        }
    }

    async fn clear_token(&self) {
        let path = self.token_path.clone();
        let _ = run_blocking(move || {
            let _ = std::fs::remove_file(&path);
            Ok(())
        })
        .await;
    }
}
