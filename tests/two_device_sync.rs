//! End-to-end client engine scenarios against a live relay.
//!
//! One side is a real `SyncEngine` over a temp vault (watcher, scanner,
//! journal, E2E sealing all active); the other side is a scripted peer
//! driving the wire directly, so every exchange is deterministic.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use vaultsync::crypto::{self, VaultKey};
use vaultsync::engine::{EngineConfig, SyncEngine};
use vaultsync::protocol::{decode_frame, encode_frame, SyncMessage};
use vaultsync::relay::{RelayConfig, RelayServer};
use vaultsync::types::{ChangeEntry, ChangeKind, ChangeSource, ConflictStrategy};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const PASSPHRASE: &str = "the shared vault passphrase";
const PEER_DEVICE: &str = "aaaabbbbccccdddd";

struct Peer {
    ws: Ws,
    key: VaultKey,
    vault_id: String,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Peer {
        let key = crypto::derive_key(PASSPHRASE);
        let vault_id = crypto::vault_id(&key);
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
            .await
            .expect("peer connect");

        let hello = SyncMessage::Hello {
            device_id: PEER_DEVICE.to_string(),
            device_name: "scripted-peer".to_string(),
            vault_id: vault_id.clone(),
            device_token: None,
        };
        let frame = encode_frame(&hello, None).unwrap();
        ws.send(Message::Text(frame.into())).await.unwrap();

        let mut peer = Peer { ws, key, vault_id };
        peer.recv_until(|m| matches!(m, SyncMessage::HelloAck { .. }), 5_000)
            .await
            .expect("hello-ack");
        peer
    }

    async fn send(&mut self, msg: &SyncMessage) {
        let frame = encode_frame(msg, Some(&self.key)).unwrap();
        self.ws.send(Message::Text(frame.into())).await.unwrap();
    }

    /// Read frames (decrypting ours) until `pred` matches or the deadline
    /// passes.
    async fn recv_until(
        &mut self,
        pred: impl Fn(&SyncMessage) -> bool,
        deadline_ms: u64,
    ) -> Option<SyncMessage> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let frame = match tokio::time::timeout(remaining, self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) => return None,
                Err(_) => return None,
            };
            let Ok(msg) = decode_frame(&frame, Some(&self.key)) else {
                continue;
            };
            if pred(&msg) {
                return Some(msg);
            }
        }
    }

    /// Serve one file-request with the given body.
    async fn answer_fetch(&mut self, body: &[u8]) -> Option<(String, String)> {
        use base64::{engine::general_purpose::STANDARD, Engine};
        let request = self
            .recv_until(|m| matches!(m, SyncMessage::FileRequest { .. }), 10_000)
            .await?;
        let SyncMessage::FileRequest {
            path, content_hash, ..
        } = request
        else {
            return None;
        };
        self.send(&SyncMessage::FileResponse {
            path: path.clone(),
            content_hash: content_hash.clone(),
            content: Some(STANDARD.encode(body)),
            from_device_id: PEER_DEVICE.to_string(),
        })
        .await;
        Some((path, content_hash))
    }
}

async fn start_relay() -> RelayServer {
    RelayServer::start(RelayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    })
    .await
    .expect("relay start")
}

async fn start_engine(vault: &Path, addr: SocketAddr) -> SyncEngine {
    let mut config = EngineConfig::new(
        vault.to_path_buf(),
        format!("ws://{}/", addr),
        PASSPHRASE.to_string(),
    );
    config.device_name = "engine-under-test".to_string();
    config.strategy = ConflictStrategy::NewerWins;
    let engine = SyncEngine::start(config).await.expect("engine start");

    // Wait for the hello/ack handshake to complete.
    wait_for(|| engine.is_connected(), 10_000).await;
    assert!(engine.is_connected(), "engine never connected");
    engine
}

async fn wait_for(mut cond: impl FnMut() -> bool, deadline_ms: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn remote_delta(path: &str, body: &str, mtime_ms: i64) -> SyncMessage {
    SyncMessage::DeltaPush {
        change: ChangeEntry {
            id: 7,
            path: path.to_string(),
            old_path: None,
            kind: ChangeKind::Create,
            content_hash: Some(crypto::content_hash(body.as_bytes())),
            size: Some(body.len() as u64),
            mtime_ms: Some(mtime_ms),
            detected_at_ms: mtime_ms,
            source: ChangeSource::Watcher,
            device_id: PEER_DEVICE.to_string(),
        },
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_delta_lands_on_disk_with_remote_journal_entry() {
    let relay = start_relay().await;
    let vault = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(vault.path().join("Notebooks")).unwrap();

    let mut peer = Peer::connect(relay.local_addr()).await;
    let engine = start_engine(vault.path(), relay.local_addr()).await;
    assert_eq!(engine.vault_id(), peer.vault_id);

    // Peer announces a file the engine has never seen.
    peer.send(&remote_delta(
        "Notebooks/b.md",
        "hello",
        crypto::epoch_ms(),
    ))
    .await;

    // The engine fetches the body from us.
    let served = peer.answer_fetch(b"hello").await.expect("file-request");
    assert_eq!(served.0, "Notebooks/b.md");
    assert_eq!(served.1, crypto::content_hash(b"hello"));

    // File lands, hash cache updates, journal carries a remote-source row.
    let target = vault.path().join("Notebooks/b.md");
    wait_for(|| target.is_file(), 10_000).await;
    assert_eq!(std::fs::read_to_string(&target).unwrap(), "hello");
    assert_eq!(
        engine.local_hash("Notebooks/b.md").as_deref(),
        Some(crypto::content_hash(b"hello").as_str())
    );

    let changes = engine.store().after(0, 100).unwrap();
    let remote_row = changes
        .iter()
        .find(|c| c.path == "Notebooks/b.md" && c.source == ChangeSource::Remote)
        .expect("remote journal entry");
    assert_eq!(remote_row.device_id, PEER_DEVICE);

    // The apply is acknowledged.
    let ack = peer
        .recv_until(|m| matches!(m, SyncMessage::DeltaAck { .. }), 5_000)
        .await;
    assert!(ack.is_some(), "delta-ack not received");

    engine.stop().await;
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn local_write_is_watched_hashed_and_published() {
    let relay = start_relay().await;
    let vault = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(vault.path().join("Notebooks")).unwrap();

    let mut peer = Peer::connect(relay.local_addr()).await;
    let engine = start_engine(vault.path(), relay.local_addr()).await;

    std::fs::write(vault.path().join("Notebooks/out.md"), "from engine").unwrap();

    let push = peer
        .recv_until(
            |m| matches!(m, SyncMessage::DeltaPush { change } if change.path == "Notebooks/out.md"),
            15_000,
        )
        .await
        .expect("delta-push from engine");
    let SyncMessage::DeltaPush { change } = push else {
        unreachable!()
    };
    assert_eq!(change.kind, ChangeKind::Create);
    assert_eq!(change.source, ChangeSource::Watcher);
    assert_eq!(
        change.content_hash.as_deref(),
        Some(crypto::content_hash(b"from engine").as_str())
    );
    assert_eq!(change.device_id, engine.device_id());
    assert!(change.id > 0);

    engine.stop().await;
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn newer_remote_wins_and_local_copy_is_preserved() {
    let relay = start_relay().await;
    let vault = tempfile::tempdir().unwrap();
    // Local divergent content exists before the engine starts; the initial
    // scan journals it.
    std::fs::write(vault.path().join("n.md"), "B").unwrap();

    let mut peer = Peer::connect(relay.local_addr()).await;
    let engine = start_engine(vault.path(), relay.local_addr()).await;
    wait_for(|| engine.local_hash("n.md").is_some(), 10_000).await;

    // Remote edit with a clearly newer mtime.
    peer.send(&remote_delta("n.md", "A", crypto::epoch_ms() + 60_000))
        .await;
    peer.answer_fetch(b"A").await.expect("file-request");

    // Winner content replaces the file.
    wait_for(
        || std::fs::read_to_string(vault.path().join("n.md")).ok() == Some("A".to_string()),
        10_000,
    )
    .await;
    assert_eq!(
        std::fs::read_to_string(vault.path().join("n.md")).unwrap(),
        "A"
    );

    // The losing local copy is preserved as a conflict sibling.
    let conflict_file = std::fs::read_dir(vault.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .find(|name| name.contains(".sync-conflict-"))
        .expect("conflict copy exists");
    assert!(conflict_file.starts_with("n.sync-conflict-"));
    assert!(conflict_file.ends_with(".md"));
    assert_eq!(
        std::fs::read_to_string(vault.path().join(&conflict_file)).unwrap(),
        "B"
    );

    engine.stop().await;
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn own_changes_are_never_reapplied() {
    let relay = start_relay().await;
    let vault = tempfile::tempdir().unwrap();

    let mut peer = Peer::connect(relay.local_addr()).await;
    let engine = start_engine(vault.path(), relay.local_addr()).await;

    // Echo the engine's own identity back at it.
    let echo = SyncMessage::DeltaPush {
        change: ChangeEntry {
            id: 1,
            path: "echo.md".to_string(),
            old_path: None,
            kind: ChangeKind::Create,
            content_hash: Some(crypto::content_hash(b"echo")),
            size: Some(4),
            mtime_ms: Some(crypto::epoch_ms()),
            detected_at_ms: crypto::epoch_ms(),
            source: ChangeSource::Watcher,
            device_id: engine.device_id().to_string(),
        },
    };
    peer.send(&echo).await;

    // No fetch, no file, no journal row.
    let fetch = peer
        .recv_until(|m| matches!(m, SyncMessage::FileRequest { .. }), 1_500)
        .await;
    assert!(fetch.is_none(), "echoed change triggered a fetch");
    assert!(!vault.path().join("echo.md").exists());
    assert!(engine
        .store()
        .after(0, 100)
        .unwrap()
        .iter()
        .all(|c| c.path != "echo.md"));

    engine.stop().await;
    relay.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn catchup_batch_applies_and_chains() {
    let relay = start_relay().await;
    let vault = tempfile::tempdir().unwrap();

    let mut peer = Peer::connect(relay.local_addr()).await;
    let engine = start_engine(vault.path(), relay.local_addr()).await;

    // The engine asks for catchup right after connecting.
    let request = peer
        .recv_until(|m| matches!(m, SyncMessage::IndexRequest { .. }), 10_000)
        .await
        .expect("index-request");
    let SyncMessage::IndexRequest {
        since_change_id, ..
    } = request
    else {
        unreachable!()
    };
    assert_eq!(since_change_id, 0);

    // Answer with a two-entry batch claiming more to come.
    let body = "caught up";
    let mut entry = match remote_delta("c1.md", body, crypto::epoch_ms()) {
        SyncMessage::DeltaPush { change } => change,
        _ => unreachable!(),
    };
    entry.id = 41;
    let mut entry2 = entry.clone();
    entry2.id = 42;
    entry2.path = "c2.md".to_string();

    peer.send(&SyncMessage::IndexResponse {
        changes: vec![entry, entry2],
        latest_change_id: 42,
        has_more: true,
        from_device_id: PEER_DEVICE.to_string(),
    })
    .await;

    // Both applies fetch content; serve them in arrival order.
    peer.answer_fetch(body.as_bytes()).await.expect("fetch 1");
    peer.answer_fetch(body.as_bytes()).await.expect("fetch 2");

    wait_for(
        || {
            vault.path().join("c1.md").is_file() && vault.path().join("c2.md").is_file()
        },
        10_000,
    )
    .await;
    assert_eq!(
        std::fs::read_to_string(vault.path().join("c1.md")).unwrap(),
        body
    );

    // has_more chains the next request from the batch high-water mark.
    let next = peer
        .recv_until(
            |m| matches!(m, SyncMessage::IndexRequest { since_change_id, .. } if *since_change_id == 42),
            10_000,
        )
        .await;
    assert!(next.is_some(), "follow-up index-request not observed");

    engine.stop().await;
    relay.shutdown().await;
}
