//! Wire protocol: message union, envelope routing, frame (de)serialization.
//!
//! Every frame on the wire is `{"encrypted": bool, "payload": ...}` as JSON
//! text. When a vault key is active on the sender, every message outside the
//! plaintext whitelist is sealed into an AEAD envelope before transmission.
//! The whitelist exists so handshake and liveness work before (or without)
//! key agreement; everything else is opaque to the relay.

use serde::{Deserialize, Serialize};

use crate::crypto::{self, Envelope, VaultKey};
use crate::error::{Result, SyncError};
use crate::types::{ChangeEntry, DeviceInfo};

/// Error codes emitted by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    AuthFailed,
    VaultFull,
    DeviceOffline,
    NotAuthenticated,
}

/// The closed set of protocol messages. Unknown types are rejected on
/// ingress by serde's tagged deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum SyncMessage {
    /// Opens a connection. Always plaintext so bootstrap works before key
    /// agreement; carries only identifiers, never key material.
    Hello {
        device_id: String,
        device_name: String,
        vault_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_token: Option<String>,
    },
    HelloAck {
        assigned_token: String,
        connected_devices: Vec<DeviceInfo>,
        server_version: String,
    },

    /// Catchup: ask peers for changes after a cursor.
    IndexRequest {
        since_change_id: i64,
        from_device_id: String,
    },
    IndexResponse {
        changes: Vec<ChangeEntry>,
        latest_change_id: i64,
        has_more: bool,
        from_device_id: String,
    },

    /// Realtime: one change, broadcast to the vault room.
    DeltaPush { change: ChangeEntry },
    DeltaAck {
        change_id: i64,
        from_device_id: String,
    },

    /// Fetch file content by (path, hash) from a specific peer.
    FileRequest {
        path: String,
        content_hash: String,
        target_device_id: String,
        from_device_id: String,
    },
    FileResponse {
        path: String,
        content_hash: String,
        /// Base64 of the file body; None when the responder no longer has
        /// matching content.
        content: Option<String>,
        from_device_id: String,
    },

    /// Pairing: hash of the 6-digit code shown on the new device.
    PairRequest {
        device_id: String,
        device_name: String,
        pairing_code_hash: String,
    },
    PairConfirm { device_id: String, approved: bool },
    DeviceList { devices: Vec<DeviceInfo> },

    Ping { timestamp: i64 },
    Pong { timestamp: i64 },

    Error { code: ErrorCode, message: String },
}

impl SyncMessage {
    /// The plaintext whitelist. Everything else MUST be sealed when a key
    /// is active. Exhaustive match so adding a variant forces a decision.
    pub fn is_plaintext(&self) -> bool {
        match self {
            SyncMessage::Hello { .. }
            | SyncMessage::HelloAck { .. }
            | SyncMessage::Ping { .. }
            | SyncMessage::Pong { .. }
            | SyncMessage::Error { .. }
            | SyncMessage::PairRequest { .. }
            | SyncMessage::PairConfirm { .. } => true,
            SyncMessage::IndexRequest { .. }
            | SyncMessage::IndexResponse { .. }
            | SyncMessage::DeltaPush { .. }
            | SyncMessage::DeltaAck { .. }
            | SyncMessage::FileRequest { .. }
            | SyncMessage::FileResponse { .. }
            | SyncMessage::DeviceList { .. } => false,
        }
    }

    /// Short label for logs. Never includes payload contents.
    pub fn label(&self) -> &'static str {
        match self {
            SyncMessage::Hello { .. } => "hello",
            SyncMessage::HelloAck { .. } => "hello-ack",
            SyncMessage::IndexRequest { .. } => "index-request",
            SyncMessage::IndexResponse { .. } => "index-response",
            SyncMessage::DeltaPush { .. } => "delta-push",
            SyncMessage::DeltaAck { .. } => "delta-ack",
            SyncMessage::FileRequest { .. } => "file-request",
            SyncMessage::FileResponse { .. } => "file-response",
            SyncMessage::PairRequest { .. } => "pair-request",
            SyncMessage::PairConfirm { .. } => "pair-confirm",
            SyncMessage::DeviceList { .. } => "device-list",
            SyncMessage::Ping { .. } => "ping",
            SyncMessage::Pong { .. } => "pong",
            SyncMessage::Error { .. } => "error",
        }
    }
}

/// The outer wire frame. `payload` is either a plaintext `SyncMessage`
/// object or an `Envelope` when `encrypted` is true.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    pub encrypted: bool,
    pub payload: serde_json::Value,
}

/// Serialize a message for the wire. With an active key, non-whitelisted
/// messages are sealed; without one, everything goes out in plaintext.
pub fn encode_frame(msg: &SyncMessage, key: Option<&VaultKey>) -> Result<String> {
    let frame = match key {
        Some(key) if !msg.is_plaintext() => {
            let plaintext = serde_json::to_vec(msg)?;
            let envelope = crypto::seal(key, &plaintext)?;
            WireFrame {
                encrypted: true,
                payload: serde_json::to_value(envelope)?,
            }
        }
        _ => WireFrame {
            encrypted: false,
            payload: serde_json::to_value(msg)?,
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Parse the outer frame without touching the payload. This is the only
/// decoding step the relay performs on encrypted traffic.
pub fn decode_outer(text: &str) -> Result<WireFrame> {
    serde_json::from_str(text).map_err(|e| SyncError::protocol(format!("bad frame: {}", e)))
}

/// Decode a full frame into a message. An encrypted frame without a local
/// key is a hard protocol error; a decrypt failure is reported uniformly.
pub fn decode_frame(text: &str, key: Option<&VaultKey>) -> Result<SyncMessage> {
    let frame = decode_outer(text)?;
    if frame.encrypted {
        let key = key.ok_or_else(|| {
            SyncError::protocol("received encrypted frame but no vault key is configured")
        })?;
        let envelope: Envelope = serde_json::from_value(frame.payload)
            .map_err(|e| SyncError::protocol(format!("bad envelope: {}", e)))?;
        let plaintext = crypto::open(key, &envelope)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| SyncError::protocol(format!("bad inner message: {}", e)))
    } else {
        serde_json::from_value(frame.payload)
            .map_err(|e| SyncError::protocol(format!("unknown message: {}", e)))
    }
}

/// Convenience for relay-side error replies.
pub fn error_frame(code: ErrorCode, message: impl Into<String>) -> String {
    // Errors are whitelisted plaintext; encoding them cannot fail.
    encode_frame(
        &SyncMessage::Error {
            code,
            message: message.into(),
        },
        None,
    )
    .unwrap_or_else(|_| String::from(r#"{"encrypted":false,"payload":{"type":"error","code":"PARSE_ERROR","message":"internal"}}"#))
}
