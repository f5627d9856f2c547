//! Daemon configuration
//!
//! Loaded from `~/.config/la-vak/daemon.toml`; a default file is
//! written on first run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// Daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Device configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Transfer behavior
    #[serde(default)]
    pub transfers: TransferSettings,
}

/// Device configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name announced to the network
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Port advertised for the control facade (0 when none is running)
    #[serde(default)]
    pub http_port: u16,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Discovery broadcast interval in seconds
    #[serde(default = "default_broadcast_interval")]
    pub broadcast_interval_secs: u64,

    /// Seconds of silence before a peer is evicted
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
}

/// Transfer behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Where accepted files are written
    #[serde(default = "default_downloads_dir")]
    pub downloads_dir: PathBuf,

    /// Accept every incoming transfer without asking.
    /// Off by default; useful for headless nodes.
    #[serde(default)]
    pub auto_accept: bool,
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "La-Vak Device".to_string())
}

fn default_broadcast_interval() -> u64 {
    3
}

fn default_peer_timeout() -> u64 {
    10
}

fn default_downloads_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Downloads")
        .join("la-vak")
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            http_port: 0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            broadcast_interval_secs: default_broadcast_interval(),
            peer_timeout_secs: default_peer_timeout(),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            downloads_dir: default_downloads_dir(),
            auto_accept: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig::default(),
            network: NetworkConfig::default(),
            transfers: TransferSettings::default(),
        }
    }
}

impl Config {
    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("la-vak")
            .join("daemon.toml")
    }

    /// Load configuration from file, creating a default one if missing
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&config_path, contents).context("Failed to write config file")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.broadcast_interval_secs, 3);
        assert_eq!(config.network.peer_timeout_secs, 10);
        assert!(!config.transfers.auto_accept);
        assert!(config.transfers.downloads_dir.ends_with("Downloads/la-vak"));
        assert!(!config.device.name.is_empty());
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.network.broadcast_interval_secs,
            config.network.broadcast_interval_secs
        );
        assert_eq!(parsed.transfers.auto_accept, config.transfers.auto_accept);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Config = toml::from_str("[transfers]\nauto_accept = true\n").unwrap();
        assert!(parsed.transfers.auto_accept);
        assert_eq!(parsed.network.peer_timeout_secs, 10);
        assert!(!parsed.device.name.is_empty());
    }
}
