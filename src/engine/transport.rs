//! Reconnecting WebSocket transport to the relay.
//!
//! A background task owns the connect/reconnect loop with exponential
//! backoff (1s doubling to a 30s cap, reset on success). The send half is
//! shared behind a mutex so the engine can transmit from any task; the
//! receive half feeds decoded text frames into an event channel.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

/// Initial reconnect delay.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Reconnect delay cap.
const BACKOFF_MAX: Duration = Duration::from_secs(30);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connection lifecycle and traffic, as seen by the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// A fresh connection is up; the engine should say hello.
    Connected,
    /// The connection dropped; the reconnect loop is already backing off.
    Disconnected,
    /// One text frame from the relay.
    Frame(String),
}

pub struct Transport {
    sink: Arc<Mutex<Option<WsSink>>>,
    shutdown: watch::Sender<bool>,
}

impl Transport {
    /// Spawn the connect loop. Events arrive on `event_tx` until `stop`.
    pub fn start(url: String, event_tx: mpsc::UnboundedSender<TransportEvent>) -> Transport {
        let sink: Arc<Mutex<Option<WsSink>>> = Arc::new(Mutex::new(None));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task_sink = sink.clone();
        tokio::spawn(connect_loop(url, task_sink, event_tx, shutdown_rx));

        Transport {
            sink,
            shutdown: shutdown_tx,
        }
    }

    /// Send one already-encoded frame. Fails with `Closed` while offline;
    /// the caller decides whether to queue.
    pub async fn send(&self, frame: String) -> Result<()> {
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => sink
                .send(Message::Text(frame.into()))
                .await
                .map_err(SyncError::from),
            None => Err(SyncError::Closed),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.sink.lock().await.is_some()
    }

    /// Drop the current connection; the loop will dial again with fresh
    /// backoff. Used when liveness checks decide the link is dead.
    pub async fn force_reconnect(&self) {
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }

    /// Idempotent stop: ends the connect loop and closes any live socket.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut guard = self.sink.lock().await;
        if let Some(mut sink) = guard.take() {
            let _ = sink.send(Message::Close(None)).await;
        }
    }
}

async fn connect_loop(
    url: String,
    sink: Arc<Mutex<Option<WsSink>>>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut delay = BACKOFF_INITIAL;
    let mut first_attempt = true;

    loop {
        if *shutdown.borrow() {
            break;
        }
        if !first_attempt {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
        }
        first_attempt = false;

        let ws_stream = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((stream, _response)) => stream,
            Err(e) => {
                debug!(error = %e, next_retry = ?delay, "relay connect failed");
                delay = (delay * 2).min(BACKOFF_MAX);
                continue;
            }
        };
        info!(url = %url, "connected to relay");
        delay = BACKOFF_INITIAL;

        let (ws_tx, mut ws_rx) = ws_stream.split();
        *sink.lock().await = Some(ws_tx);
        if event_tx.send(TransportEvent::Connected).is_err() {
            break;
        }

        // Read until the connection dies or we are told to stop.
        loop {
            tokio::select! {
                frame = ws_rx.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if event_tx
                                .send(TransportEvent::Frame(text.to_string()))
                                .is_err()
                            {
                                return;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {} // ws-level ping/pong handled by tungstenite
                        Some(Err(e)) => {
                            warn!(error = %e, "relay receive error");
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    *sink.lock().await = None;
                    return;
                }
            }
        }

        *sink.lock().await = None;
        if event_tx.send(TransportEvent::Disconnected).is_err() {
            break;
        }
        info!("relay connection lost; reconnecting");
    }
}
