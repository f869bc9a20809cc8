//! Per-connection protocol handling.
//!
//! The relay parses only the outer frame and the plaintext whitelist. An
//! encrypted payload is routed as raw bytes; there is no decrypt path in
//! this module or anywhere else on the server.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use super::room::{RoomMember, RoomRegistry};
use crate::crypto::{self, epoch_ms};
use crate::error::run_blocking;
use crate::protocol::{self, ErrorCode, SyncMessage};

/// Shared server state handed to every connection task.
pub struct RelayState {
    pub registry: DeviceRegistry,
    pub rooms: RoomRegistry,
    pub server_secret: Vec<u8>,
    pub max_devices_per_vault: usize,
    pub server_version: String,
    /// Pairing approvals: (vault_id, device_id) -> device_name, recorded
    /// when an existing member confirms. The next hello from that device
    /// counts as registered and passes the vault cap.
    pub pending_pairs: Mutex<HashMap<(String, String), String>>,
}

/// Identity attached to a connection after a successful hello.
struct ConnAuth {
    vault_id: String,
    device_id: String,
}

/// Run one WebSocket connection to completion.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Outbound frames funnel through a channel so room broadcasts never
    // touch the socket directly.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut auth: Option<ConnAuth> = None;

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text.to_string(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue, // binary/ping/pong are not part of the protocol
            Err(e) => {
                debug!(error = %e, "websocket receive error");
                break;
            }
        };

        match handle_frame(&state, &out_tx, &mut auth, &text).await {
            FrameResult::Continue => {}
            FrameResult::Close => break,
        }
    }

    // Disconnect: drop from the room, tell the remaining members.
    if let Some(conn) = &auth {
        state.rooms.leave(&conn.vault_id, &conn.device_id);
        {
            let state = state.clone();
            let device_id = conn.device_id.clone();
            let vault_id = conn.vault_id.clone();
            if let Err(e) = run_blocking(move || {
                state.registry.touch_last_seen(&device_id, &vault_id, epoch_ms())
            })
            .await
            {
                warn!(error = %e, "last-seen update on disconnect failed");
            }
        }
        broadcast_device_list(&state, &conn.vault_id, None);
        info!(device = %conn.device_id, vault = %conn.vault_id, "device disconnected");
    }
    drop(out_tx);
    let _ = writer.await;
}

enum FrameResult {
    Continue,
    Close,
}

async fn handle_frame(
    state: &Arc<RelayState>,
    out_tx: &mpsc::UnboundedSender<String>,
    auth: &mut Option<ConnAuth>,
    text: &str,
) -> FrameResult {
    let outer = match protocol::decode_outer(text) {
        Ok(frame) => frame,
        Err(_) => {
            let _ = out_tx.send(protocol::error_frame(ErrorCode::ParseError, "bad frame"));
            return FrameResult::Continue;
        }
    };

    // Opaque ciphertext: route raw, never inspect.
    if outer.encrypted {
        match auth {
            Some(conn) => {
                state
                    .rooms
                    .broadcast(&conn.vault_id, text, Some(&conn.device_id));
                buffer_for_offline_peers(state, &conn.vault_id, &conn.device_id, text).await;
            }
            None => {
                let _ = out_tx.send(protocol::error_frame(
                    ErrorCode::NotAuthenticated,
                    "hello first",
                ));
            }
        }
        return FrameResult::Continue;
    }

    let msg: SyncMessage = match serde_json::from_value(outer.payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "unparseable plaintext payload");
            let _ = out_tx.send(protocol::error_frame(
                ErrorCode::ParseError,
                "unknown message",
            ));
            return FrameResult::Continue;
        }
    };

    match msg {
        SyncMessage::Hello {
            device_id,
            device_name,
            vault_id,
            device_token,
        } => {
            handle_hello(state, out_tx, auth, device_id, device_name, vault_id, device_token)
                .await
        }

        SyncMessage::Ping { timestamp: _ } => {
            if let Some(conn) = auth {
                let state = state.clone();
                let device_id = conn.device_id.clone();
                let vault_id = conn.vault_id.clone();
                let _ = run_blocking(move || {
                    state.registry.touch_last_seen(&device_id, &vault_id, epoch_ms())
                })
                .await;
            }
            let pong = SyncMessage::Pong {
                timestamp: epoch_ms(),
            };
            if let Ok(frame) = protocol::encode_frame(&pong, None) {
                let _ = out_tx.send(frame);
            }
            FrameResult::Continue
        }

        SyncMessage::PairRequest {
            ref device_id,
            ref device_name,
            ..
        } => match auth {
            Some(conn) => {
                // Remember who is being introduced; approval lands below.
                state.pending_pairs.lock().unwrap().insert(
                    (conn.vault_id.clone(), device_id.clone()),
                    device_name.clone(),
                );
                state
                    .rooms
                    .broadcast(&conn.vault_id, text, Some(&conn.device_id));
                FrameResult::Continue
            }
            None => not_authenticated(out_tx),
        },

        SyncMessage::PairConfirm {
            ref device_id,
            approved,
        } => match auth {
            Some(conn) => {
                if approved {
                    let name = state
                        .pending_pairs
                        .lock()
                        .unwrap()
                        .remove(&(conn.vault_id.clone(), device_id.clone()));
                    if let Some(name) = name {
                        // Pre-register so the paired device's next hello is
                        // accepted within the vault cap.
                        let state = state.clone();
                        let device_id = device_id.clone();
                        let vault_id = conn.vault_id.clone();
                        if let Err(e) = run_blocking(move || {
                            state
                                .registry
                                .upsert_device(&device_id, &vault_id, &name, "", epoch_ms())
                        })
                        .await
                        {
                            warn!(error = %e, "pair pre-registration failed");
                        }
                    }
                }
                state
                    .rooms
                    .broadcast(&conn.vault_id, text, Some(&conn.device_id));
                FrameResult::Continue
            }
            None => not_authenticated(out_tx),
        },

        // Plaintext-mode sync traffic (no E2E key configured on clients).
        SyncMessage::DeltaPush { .. } => match auth {
            Some(conn) => {
                state
                    .rooms
                    .broadcast(&conn.vault_id, text, Some(&conn.device_id));
                buffer_for_offline_peers(state, &conn.vault_id, &conn.device_id, text).await;
                FrameResult::Continue
            }
            None => not_authenticated(out_tx),
        },

        SyncMessage::IndexRequest { .. }
        | SyncMessage::IndexResponse { .. }
        | SyncMessage::DeltaAck { .. }
        | SyncMessage::FileResponse { .. } => match auth {
            Some(conn) => {
                state
                    .rooms
                    .broadcast(&conn.vault_id, text, Some(&conn.device_id));
                FrameResult::Continue
            }
            None => not_authenticated(out_tx),
        },

        SyncMessage::FileRequest {
            ref target_device_id,
            ..
        } => match auth {
            Some(conn) => {
                if !state.rooms.send_to(&conn.vault_id, target_device_id, text) {
                    let _ = out_tx.send(protocol::error_frame(
                        ErrorCode::DeviceOffline,
                        format!("device {} is offline", target_device_id),
                    ));
                }
                FrameResult::Continue
            }
            None => not_authenticated(out_tx),
        },

        // Server-originated shapes arriving from a client are dropped.
        SyncMessage::HelloAck { .. }
        | SyncMessage::DeviceList { .. }
        | SyncMessage::Pong { .. }
        | SyncMessage::Error { .. } => FrameResult::Continue,
    }
}

fn not_authenticated(out_tx: &mpsc::UnboundedSender<String>) -> FrameResult {
    let _ = out_tx.send(protocol::error_frame(
        ErrorCode::NotAuthenticated,
        "hello first",
    ));
    FrameResult::Continue
}

/// Outcome of the registry admission round-trip.
enum Admission {
    Admitted(String),
    VaultFull(usize),
}

#[allow(clippy::too_many_arguments)]
async fn handle_hello(
    state: &Arc<RelayState>,
    out_tx: &mpsc::UnboundedSender<String>,
    auth: &mut Option<ConnAuth>,
    device_id: String,
    device_name: String,
    vault_id: String,
    device_token: Option<String>,
) -> FrameResult {
    let now = epoch_ms();

    // A presented token must verify and match the claimed identity.
    if let Some(token) = &device_token {
        match crypto::verify_device_token(token, now, &state.server_secret) {
            Ok(claims) if claims.device_id == device_id && claims.vault_id == vault_id => {}
            Ok(_) => {
                warn!(device = %device_id, "token identity mismatch");
                let _ = out_tx.send(protocol::error_frame(
                    ErrorCode::AuthFailed,
                    "token does not match device",
                ));
                return FrameResult::Close;
            }
            Err(e) => {
                warn!(device = %device_id, error = %e, "token verification failed");
                let _ = out_tx.send(protocol::error_frame(
                    ErrorCode::AuthFailed,
                    "invalid or expired token",
                ));
                return FrameResult::Close;
            }
        }
    }

    // Registry admission runs off the reader thread: the cap lookup, token
    // mint, and upsert are one blocking round-trip. The cap applies only
    // to devices the registry has never seen.
    let admission = {
        let state = state.clone();
        let device_id = device_id.clone();
        let device_name = device_name.clone();
        let vault_id = vault_id.clone();
        run_blocking(move || {
            let known = state.registry.is_registered(&device_id, &vault_id)?;
            if !known {
                let count = state.registry.device_count(&vault_id)?;
                if count >= state.max_devices_per_vault {
                    return Ok(Admission::VaultFull(count));
                }
            }
            let token =
                crypto::mint_device_token(&device_id, &vault_id, now, &state.server_secret)?;
            state
                .registry
                .upsert_device(&device_id, &vault_id, &device_name, &token, now)?;
            Ok(Admission::Admitted(token))
        })
        .await
    };
    let assigned_token = match admission {
        Ok(Admission::Admitted(token)) => token,
        Ok(Admission::VaultFull(count)) => {
            let _ = out_tx.send(protocol::error_frame(
                ErrorCode::VaultFull,
                format!("vault has {} devices (limit {})", count, state.max_devices_per_vault),
            ));
            return FrameResult::Close;
        }
        Err(e) => {
            warn!(device = %device_id, error = %e, "registry admission failed");
            let _ = out_tx.send(protocol::error_frame(ErrorCode::AuthFailed, "internal"));
            return FrameResult::Close;
        }
    };

    // Join the room; frames buffered while offline follow the hello-ack.
    let drained = state.rooms.join(
        &vault_id,
        RoomMember {
            device_id: device_id.clone(),
            device_name: device_name.clone(),
            tx: out_tx.clone(),
        },
    );

    let connected_devices: Vec<_> = state
        .rooms
        .members(&vault_id)
        .into_iter()
        .filter(|d| d.device_id != device_id)
        .collect();

    let ack = SyncMessage::HelloAck {
        assigned_token,
        connected_devices,
        server_version: state.server_version.clone(),
    };
    if let Ok(frame) = protocol::encode_frame(&ack, None) {
        let _ = out_tx.send(frame);
    }

    let drained_count = drained.len();
    for frame in drained {
        let _ = out_tx.send(frame);
    }

    info!(
        device = %device_id,
        vault = %vault_id,
        drained = drained_count,
        "device connected"
    );

    *auth = Some(ConnAuth {
        vault_id: vault_id.clone(),
        device_id: device_id.clone(),
    });

    broadcast_device_list(state, &vault_id, Some(&device_id));
    FrameResult::Continue
}

/// Send the current member list to a room, optionally excluding one device.
fn broadcast_device_list(state: &Arc<RelayState>, vault_id: &str, exclude: Option<&str>) {
    let msg = SyncMessage::DeviceList {
        devices: state.rooms.members(vault_id),
    };
    // device-list is not whitelisted, but the relay holds no key: in E2E
    // deployments clients treat the plaintext roster as advisory only.
    if let Ok(frame) = protocol::encode_frame(&msg, None) {
        state.rooms.broadcast(vault_id, &frame, exclude);
    }
}

/// Queue a frame for every registered vault device that is not online.
async fn buffer_for_offline_peers(
    state: &Arc<RelayState>,
    vault_id: &str,
    sender: &str,
    raw: &str,
) {
    let devices = {
        let state = state.clone();
        let vault_id = vault_id.to_string();
        match run_blocking(move || state.registry.devices_in_vault(&vault_id)).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "offline buffering skipped");
                return;
            }
        }
    };
    for device in devices {
        if device.device_id == sender {
            continue;
        }
        if state.rooms.is_online(vault_id, &device.device_id) {
            continue;
        }
        state
            .rooms
            .buffer_offline(vault_id, &device.device_id, raw);
    }
}
