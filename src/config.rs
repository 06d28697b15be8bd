//! Tunnel manager configuration loaded from TOML.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Path to the OpenSSH client config used to resolve host aliases
    pub ssh_config_path: PathBuf,

    /// SSH connect + handshake timeout in seconds
    pub connect_timeout_secs: u64,

    /// Server binary deployment
    #[serde(default)]
    pub deploy: DeployConfig,

    /// Local listener and remote endpoint
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// Probing the remote server after launch
    #[serde(default)]
    pub readiness: ReadinessConfig,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            ssh_config_path: default_ssh_config_path(),
            connect_timeout_secs: 30,
            deploy: DeployConfig::default(),
            tunnel: TunnelSettings::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

/// Where the server binary comes from and where it goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeployConfig {
    /// Locally built server binary
    pub local_binary: PathBuf,

    /// Directory relative to the remote user's home
    pub remote_dir: String,

    /// File name of the deployed binary
    pub remote_binary: String,

    /// Skip the upload when the remote sha256 already matches
    pub skip_unchanged: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            local_binary: PathBuf::from("siview-server-linux-amd64"),
            remote_dir: ".siview/bin".to_string(),
            remote_binary: "siview-server".to_string(),
            skip_unchanged: false,
        }
    }
}

impl DeployConfig {
    /// Remote path of the binary, relative to the remote home directory.
    pub fn remote_path(&self) -> String {
        format!(
            "{}/{}",
            self.remote_dir.trim_end_matches('/'),
            self.remote_binary
        )
    }
}

/// Local listener and the remote endpoint it forwards to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelSettings {
    /// Loopback port to listen on (0 picks a free port)
    pub local_port: u16,

    /// Address the remote end of each channel connects to
    pub remote_host: String,

    /// Port the remote server listens on
    pub remote_port: u16,

    /// Per-direction relay buffer size in bytes
    pub buffer_size: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            local_port: 9000,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 9000,
            buffer_size: 4096,
        }
    }
}

/// Retry policy for waiting on the freshly started server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 20,
            initial_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

impl ReadinessConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// `~/.ssh/config`, falling back to a relative path when there is no home.
pub fn default_ssh_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("config"))
        .unwrap_or_else(|| PathBuf::from(".ssh/config"))
}

/// Default location of this tool's own config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("siview")
        .join("tunnel.toml")
}

impl TunnelConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
