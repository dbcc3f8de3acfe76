//! Configuration management for KioskMesh

use crate::error::KioskError;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "kioskmesh.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_peer_id")]
    pub peer_id: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_capabilities")]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default)]
    pub network_secret: String,
    #[serde(default)]
    pub trusted_peers: Vec<String>,
    /// `host:port` candidates, the same shape the discovery feed produces.
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_sync_interval")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MiningConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_difficulty")]
    pub initial_difficulty: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Falls back to the node's peer id when empty.
    #[serde(default)]
    pub wallet_id: String,
    #[serde(default = "default_backup_blocks")]
    pub backup_blocks: usize,
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: default_peer_id(),
            hostname: default_hostname(),
            version: default_version(),
            capabilities: default_capabilities(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: default_listen_port(),
            bind_address: default_bind_address(),
            api_port: default_api_port(),
            network_secret: String::new(),
            trusted_peers: Vec::new(),
            bootstrap_peers: Vec::new(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            sync_interval_secs: default_sync_interval(),
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_difficulty: default_difficulty(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            wallet_id: String::new(),
            backup_blocks: default_backup_blocks(),
            max_backups: default_max_backups(),
        }
    }
}

impl Config {
    /// Wallet identifier, defaulting to the peer id.
    pub fn wallet_id(&self) -> String {
        if self.wallet.wallet_id.is_empty() {
            self.node.peer_id.clone()
        } else {
            self.wallet.wallet_id.clone()
        }
    }

    /// Check the values the node cannot run without and clamp the rest.
    pub fn validate(mut self) -> Result<Self, KioskError> {
        if self.node.peer_id.trim().is_empty() {
            return Err(KioskError::Config("node.peer_id must be set".to_string()));
        }
        if self.network.network_secret.len() < 8 {
            return Err(KioskError::Config(
                "network.network_secret must be at least 8 characters".to_string(),
            ));
        }
        if self.network.heartbeat_interval_secs == 0 || self.network.sync_interval_secs == 0 {
            return Err(KioskError::Config(
                "network intervals must be greater than zero".to_string(),
            ));
        }
        self.mining.initial_difficulty = self.mining.initial_difficulty.clamp(
            crate::blockchain::MIN_DIFFICULTY,
            crate::blockchain::MAX_DIFFICULTY,
        );
        if self.wallet.max_backups == 0 {
            self.wallet.max_backups = default_max_backups();
        }
        Ok(self)
    }
}

/// Load `path`, or defaults when the file is absent, and validate.
pub fn load_config_from(path: &Path) -> Result<Config, KioskError> {
    let config: Config = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .map_err(|e| KioskError::Config(format!("{}: {}", path.display(), e)))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
        Err(e) => {
            return Err(KioskError::Config(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    config.validate()
}

pub fn load_config() -> Result<Config, KioskError> {
    load_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

fn default_peer_id() -> String {
    default_hostname()
}

fn default_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_string())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "kiosk".to_string())
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_capabilities() -> Vec<String> {
    vec![
        "ledger_sync".to_string(),
        "security_events".to_string(),
        "token_transfer".to_string(),
    ]
}

fn default_listen_port() -> u16 {
    9470
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9471
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_sync_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_transfer_timeout() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("kioskmesh"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

fn default_difficulty() -> u32 {
    4
}

fn default_max_attempts() -> u64 {
    crate::blockchain::MAX_MINING_ATTEMPTS
}

fn default_backup_blocks() -> usize {
    100
}

fn default_max_backups() -> usize {
    5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config_uses_defaults() {
        let raw = r#"
            [node]
            peer_id = "kiosk-lobby"

            [network]
            network_secret = "fleet-secret-01"
            trusted_peers = ["kiosk-cafe", "kiosk-gate"]

            [mining]
            initial_difficulty = 12
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        let config = config.validate().unwrap();

        assert_eq!(config.node.peer_id, "kiosk-lobby");
        assert_eq!(config.network.listen_port, 9470);
        assert_eq!(config.network.heartbeat_interval_secs, 30);
        assert_eq!(config.network.trusted_peers.len(), 2);
        assert_eq!(config.mining.initial_difficulty, 8);
        assert_eq!(config.wallet_id(), "kiosk-lobby");
    }

    #[test]
    fn test_short_secret_is_rejected() {
        let mut config = Config::default();
        config.node.peer_id = "kiosk-a".to_string();
        config.network.network_secret = "short".to_string();
        assert!(matches!(config.validate(), Err(KioskError::Config(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let result = load_config_from(&dir.path().join("absent.toml"));
        // Defaults carry no network secret, so validation refuses them.
        assert!(matches!(result, Err(KioskError::Config(_))));
    }
}
