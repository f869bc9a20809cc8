//! vaultsync-relay: the relay server binary.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vaultsync::relay::{RelayConfig, RelayServer, DEFAULT_MAX_DEVICES_PER_VAULT};

#[derive(Parser, Debug)]
#[command(name = "vaultsync-relay", version, about = "Vault sync relay server")]
struct Args {
    /// Port to listen on
    #[arg(long, default_value_t = 18800)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Device registry database path (in-memory when omitted)
    #[arg(long)]
    db: Option<PathBuf>,

    /// TLS certificate (PEM); requires --tls-key
    #[arg(long)]
    tls_cert: Option<PathBuf>,

    /// TLS private key (PEM); requires --tls-cert
    #[arg(long)]
    tls_key: Option<PathBuf>,

    /// Maximum devices per vault group
    #[arg(long, default_value_t = DEFAULT_MAX_DEVICES_PER_VAULT)]
    max_devices: usize,

    /// Verbose logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug {
        "vaultsync=debug"
    } else {
        "vaultsync=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        db_path: args.db,
        tls_cert: args.tls_cert,
        tls_key: args.tls_key,
        max_devices_per_vault: args.max_devices,
    };

    // A bind failure propagates as an error and exits non-zero.
    let server = RelayServer::start(config).await?;

    shutdown_signal().await;
    info!("shutdown signal received");
    server.shutdown().await;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
