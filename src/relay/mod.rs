//! The relay server: one TCP endpoint serving a WebSocket upgrade on any
//! path plus `GET /health`, with optional TLS.
//!
//! The relay authenticates devices, groups them into vault rooms, fans out
//! deltas, buffers frames for offline peers, and routes file fetches. It
//! never decrypts, never persists ciphertext, and never logs payload bytes.

mod handler;
mod registry;
mod room;

pub use handler::RelayState;
pub use registry::{DeviceRegistry, DeviceRecord};
pub use room::{RoomMember, RoomRegistry, OFFLINE_BUFFER_CAP};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, SyncError};

/// Default vault-group size limit.
pub const DEFAULT_MAX_DEVICES_PER_VAULT: usize = 10;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Registry database path; None keeps the registry in memory.
    pub db_path: Option<PathBuf>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub max_devices_per_vault: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 18800,
            db_path: None,
            tls_cert: None,
            tls_key: None,
            max_devices_per_vault: DEFAULT_MAX_DEVICES_PER_VAULT,
        }
    }
}

/// A running relay. Dropping the handle does not stop the server; call
/// `shutdown`.
pub struct RelayServer {
    state: Arc<RelayState>,
    handle: Handle<SocketAddr>,
    local_addr: SocketAddr,
}

impl RelayServer {
    /// Bind and start serving. Returns once the listener is bound, so a
    /// bind failure surfaces here rather than in the background task.
    pub async fn start(config: RelayConfig) -> Result<RelayServer> {
        let registry = DeviceRegistry::open(config.db_path.as_deref())?;
        let server_secret = registry.server_secret()?;
        let state = Arc::new(RelayState {
            registry,
            rooms: RoomRegistry::new(),
            server_secret,
            max_devices_per_vault: config.max_devices_per_vault,
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            pending_pairs: Mutex::new(HashMap::new()),
        });

        let router = Router::new()
            .route("/health", get(health))
            .fallback(upgrade)
            .with_state(state.clone());

        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| SyncError::Config(format!("invalid bind address: {}", e)))?;
        // Bind synchronously so exit codes reflect bind failures.
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let handle = Handle::new();
        let serve_handle = handle.clone();
        match (&config.tls_cert, &config.tls_key) {
            (Some(cert), Some(key)) => {
                let tls = RustlsConfig::from_pem_file(cert, key)
                    .await
                    .map_err(|e| SyncError::Config(format!("tls configuration: {}", e)))?;
                tokio::spawn(async move {
                    let _ = axum_server::from_tcp_rustls(listener, tls)
                        .expect("configure rustls acceptor")
                        .handle(serve_handle)
                        .serve(router.into_make_service())
                        .await;
                });
                info!(%local_addr, "relay listening (tls)");
            }
            (None, None) => {
                tokio::spawn(async move {
                    let _ = axum_server::from_tcp(listener)
                        .expect("configure tcp acceptor")
                        .handle(serve_handle)
                        .serve(router.into_make_service())
                        .await;
                });
                info!(%local_addr, "relay listening");
            }
            _ => {
                return Err(SyncError::Config(
                    "tls requires both --tls-cert and --tls-key".to_string(),
                ));
            }
        }

        Ok(RelayServer {
            state,
            handle,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Graceful shutdown: stop accepting, let in-flight connections close,
    /// flush the registry. Idempotent.
    pub async fn shutdown(&self) {
        self.handle.graceful_shutdown(Some(Duration::from_secs(5)));
        if let Err(e) = self.state.registry.flush() {
            tracing::warn!(error = %e, "registry flush on shutdown failed");
        }
        info!("relay stopped");
    }
}

async fn health(State(state): State<Arc<RelayState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.server_version,
    }))
}

/// WebSocket upgrade on any path. Plain HTTP requests that are not
/// upgrades get a 404.
async fn upgrade(State(state): State<Arc<RelayState>>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws.on_upgrade(move |socket| handler::handle_socket(socket, state)),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
