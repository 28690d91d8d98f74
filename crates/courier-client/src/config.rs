//! Client configuration

use courier_core::{Framing, KdfParams, KeyLength};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path; per-user folders live under `<data_dir>/users`
    pub data_dir: String,

    /// Username to log in with (may be overridden on the command line)
    pub username: Option<String>,

    /// Relay server configuration
    pub server: ServerConfig,

    /// Network timeouts
    pub network: NetworkConfig,

    /// Encryption defaults
    pub cipher: CipherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Relay address as `host:port`
    pub address: String,
    /// Framing spoken on ephemeral connections
    pub framing: Framing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Connect timeout in seconds (0 disables)
    pub connect_timeout_secs: u64,
    /// Timeout for ephemeral exchanges and payload stalls in seconds (0 disables)
    pub io_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CipherConfig {
    /// Default key size in bits
    pub key_size: KeyLength,
    /// Argon2id costs for newly encrypted files
    pub kdf: KdfParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: "~/.courier".to_string(),
            username: None,
            server: ServerConfig::default(),
            network: NetworkConfig::default(),
            cipher: CipherConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:9000".to_string(),
            framing: Framing::Lines,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            io_timeout_secs: 30,
        }
    }
}

impl Default for CipherConfig {
    fn default() -> Self {
        Self {
            key_size: KeyLength::Aes256,
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Expand ~ in data_dir path
    pub fn data_dir(&self) -> PathBuf {
        expand_path(&self.data_dir)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        secs(self.network.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        secs(self.network.io_timeout_secs)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
