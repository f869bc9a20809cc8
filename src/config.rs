//! Daemon configuration: a JSON file merged with CLI overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineConfig;
use crate::error::{Result, SyncError};
use crate::types::ConflictStrategy;

fn default_relay_url() -> String {
    "ws://127.0.0.1:18800".to_string()
}

fn default_scan_interval() -> u64 {
    3600
}

fn default_e2e() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    pub vault_path: PathBuf,
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Shared vault passphrase. Defines the vault identity; with `e2e`
    /// also the payload key.
    pub passphrase: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_e2e")]
    pub e2e: bool,
    #[serde(default)]
    pub conflict_strategy: ConflictStrategy,
    /// Extra ignore patterns on top of the built-ins.
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<DaemonConfig> {
        let content = std::fs::read_to_string(path)?;
        let config: DaemonConfig = serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.passphrase.is_empty() {
            return Err(SyncError::Config("passphrase must not be empty".into()));
        }
        if !self.relay_url.starts_with("ws://") && !self.relay_url.starts_with("wss://") {
            return Err(SyncError::Config(format!(
                "relay url must be ws:// or wss://, got {:?}",
                self.relay_url
            )));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            vault_root: self.vault_path.clone(),
            relay_url: self.relay_url.clone(),
            device_name: self.device_name.clone().unwrap_or_default(),
            passphrase: self.passphrase.clone(),
            e2e: self.e2e,
            strategy: self.conflict_strategy,
            extra_ignores: self.ignore.clone(),
            scan_interval: Duration::from_secs(self.scan_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let json = r#"{"vaultPath": "/tmp/vault", "passphrase": "p"}"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.relay_url, "ws://127.0.0.1:18800");
        assert!(config.e2e);
        assert_eq!(config.conflict_strategy, ConflictStrategy::NewerWins);
        assert_eq!(config.scan_interval_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn strategy_names_are_kebab_case() {
        let json = r#"{
            "vaultPath": "/tmp/vault",
            "passphrase": "p",
            "conflictStrategy": "merge-frontmatter"
        }"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.conflict_strategy, ConflictStrategy::MergeFrontmatter);
    }

    #[test]
    fn invalid_relay_url_rejected() {
        let json = r#"{"vaultPath": "/v", "passphrase": "p", "relayUrl": "http://x"}"#;
        let config: DaemonConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
