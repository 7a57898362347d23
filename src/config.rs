//! Configuration loading and persistence.
//!
//! Reads `{config_dir}/walletlink/config.json`, falls back to defaults for
//! anything missing, then applies `WALLETLINK_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.json";
const STORAGE_FILE: &str = "storage.json";

/// Settings for sessions, channels and the correlator.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Relay server base URL (the socket lives at `{relay_url}/rpc`).
    pub relay_url: String,
    /// Page opened by the popup channel; its origin is the only accepted sender.
    pub popup_url: String,
    /// Name announced in the handshake.
    pub dapp_name: String,
    /// Logo announced in the handshake.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dapp_logo_url: Option<String>,
    /// Chain id sent with encrypted requests until the wallet switches it.
    pub chain_id: u64,
    /// Seconds a request waits for its response.
    pub request_timeout_secs: u64,
    /// Seconds allowed for the WebSocket handshake.
    pub connect_timeout_secs: u64,
    /// Seconds between relay heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Seconds without a heartbeat ack before reconnecting.
    pub heartbeat_timeout_secs: u64,
    /// First reconnect delay in seconds.
    pub initial_backoff_secs: u64,
    /// Reconnect delay cap in seconds.
    pub max_backoff_secs: u64,
    /// Consecutive failed reconnects before the relay channel gives up.
    pub max_reconnect_attempts: u32,
    /// Backing file for [`crate::storage::FileStore`]; defaults to
    /// `{config_dir}/storage.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            relay_url: "https://www.walletlink.org".to_string(),
            popup_url: "https://keys.coinbase.com/connect".to_string(),
            dapp_name: "Dapp".to_string(),
            dapp_logo_url: None,
            chain_id: 1,
            request_timeout_secs: 60,
            connect_timeout_secs: 15,
            heartbeat_interval_secs: 10,
            heartbeat_timeout_secs: 30,
            initial_backoff_secs: 1,
            max_backoff_secs: 30,
            max_reconnect_attempts: 10,
            storage_path: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `WALLETLINK_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = match std::env::var("WALLETLINK_CONFIG_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::config_dir()
                .context("Could not determine config directory")?
                .join("walletlink"),
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from file, with environment variable overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_dir(&Self::config_dir()?)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads `config.json` from `dir`; defaults if the file does not exist.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("WALLETLINK_RELAY_URL") {
            self.relay_url = url;
        }
        if let Some(url) = lookup("WALLETLINK_POPUP_URL") {
            self.popup_url = url;
        }
        if let Some(name) = lookup("WALLETLINK_DAPP_NAME") {
            self.dapp_name = name;
        }
        if let Some(path) = lookup("WALLETLINK_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }

        let numeric = |name: &str| lookup(name).and_then(|v| v.parse::<u64>().ok());
        if let Some(v) = numeric("WALLETLINK_CHAIN_ID") {
            self.chain_id = v;
        }
        if let Some(v) = numeric("WALLETLINK_REQUEST_TIMEOUT") {
            self.request_timeout_secs = v;
        }
        if let Some(v) = numeric("WALLETLINK_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval_secs = v;
        }
        if let Some(v) = numeric("WALLETLINK_HEARTBEAT_TIMEOUT") {
            self.heartbeat_timeout_secs = v;
        }
        if let Some(v) = lookup("WALLETLINK_MAX_RECONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.max_reconnect_attempts = v;
        }
    }

    /// Persists the configuration to the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir/config.json` (owner read/write only).
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Parsed relay URL.
    pub fn relay_url(&self) -> Result<url::Url> {
        url::Url::parse(&self.relay_url).with_context(|| format!("invalid relay URL {}", self.relay_url))
    }

    /// Parsed popup URL.
    pub fn popup_url(&self) -> Result<url::Url> {
        url::Url::parse(&self.popup_url).with_context(|| format!("invalid popup URL {}", self.popup_url))
    }

    /// Storage file, defaulting into the config directory.
    pub fn storage_path(&self) -> Result<PathBuf> {
        match &self.storage_path {
            Some(path) => Ok(path.clone()),
            None => Ok(Self::config_dir()?.join(STORAGE_FILE)),
        }
    }

    /// How long a request waits for its response.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Bound on opening the relay socket.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Gap between heartbeats sent to the relay.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Relay silence tolerated before reconnecting.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// First reconnect delay.
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_secs(self.initial_backoff_secs)
    }

    /// Cap on the reconnect delay.
    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay_url, "https://www.walletlink.org");
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.max_backoff(), Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.chain_id, 1);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), Config::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            relay_url: "http://127.0.0.1:9000".to_string(),
            max_reconnect_attempts: 3,
            ..Config::default()
        };
        config.save_to_dir(dir.path()).unwrap();

        assert_eq!(Config::load_from_dir(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), r#"{"chain_id": 8453}"#).unwrap();

        let config = Config::load_from_dir(dir.path()).unwrap();
        assert_eq!(config.chain_id, 8453);
        assert_eq!(config.relay_url, Config::default().relay_url);
    }

    #[test]
    fn test_overrides() {
        let env = HashMap::from([
            ("WALLETLINK_RELAY_URL", "http://localhost:8080"),
            ("WALLETLINK_REQUEST_TIMEOUT", "5"),
            ("WALLETLINK_HEARTBEAT_INTERVAL", "not-a-number"),
            ("WALLETLINK_MAX_RECONNECT_ATTEMPTS", "2"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|name| env.get(name).map(ToString::to_string));

        assert_eq!(config.relay_url, "http://localhost:8080");
        assert_eq!(config.request_timeout_secs, 5);
        assert_eq!(config.heartbeat_interval_secs, 10);
        assert_eq!(config.max_reconnect_attempts, 2);
    }

    #[test]
    fn test_invalid_popup_url_is_an_error() {
        let config = Config {
            popup_url: "keys.example.com/connect".to_string(),
            ..Config::default()
        };
        assert!(config.popup_url().is_err());
    }
}
