//! vaultsyncd: the client sync daemon.
//!
//! Starts the change detector, the event bus, and the sync engine against
//! one vault, then runs until SIGINT/SIGTERM.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vaultsync::bus::EventBus;
use vaultsync::{DaemonConfig, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "vaultsyncd", version, about = "Vault sync daemon")]
struct Args {
    /// Config file (JSON). CLI flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Vault directory
    #[arg(long)]
    vault: Option<PathBuf>,

    /// Relay URL (ws:// or wss://)
    #[arg(long)]
    relay: Option<String>,

    /// Vault passphrase (prefer the config file or VAULTSYNC_PASSPHRASE)
    #[arg(long)]
    passphrase: Option<String>,

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

    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => {
            let vault = args
                .vault
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--vault is required without --config"))?;
            let passphrase = args
                .passphrase
                .clone()
                .or_else(|| std::env::var("VAULTSYNC_PASSPHRASE").ok())
                .ok_or_else(|| {
                    anyhow::anyhow!("passphrase required (--passphrase, config, or env)")
                })?;
            DaemonConfig {
                vault_path: vault,
                relay_url: "ws://127.0.0.1:18800".to_string(),
                passphrase,
                device_name: None,
                e2e: true,
                conflict_strategy: Default::default(),
                ignore: Vec::new(),
                scan_interval_secs: 3600,
            }
        }
    };
    if let Some(vault) = args.vault {
        config.vault_path = vault;
    }
    if let Some(relay) = args.relay {
        config.relay_url = relay;
    }
    if let Some(passphrase) = args.passphrase {
        config.passphrase = passphrase;
    }
    config.validate()?;

    let engine = SyncEngine::start(config.engine_config()).await?;
    info!(
        vault = %config.vault_path.display(),
        vault_id = engine.vault_id(),
        device_id = engine.device_id(),
        "vaultsyncd running"
    );

    // Semantic event fan-out over the shared journal.
    let bus = EventBus::new();
    bus.start(engine.store().clone(), engine.journal_notify())?;

    shutdown_signal().await;
    info!("shutdown signal received");
    bus.stop();
    engine.stop().await;
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
