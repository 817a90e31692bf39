//! Configuration handling for the management middlewares

use crate::management::ConnectionOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

pub const CONFIG_FILE_NAME: &str = "openvpn-mgmt.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub management: ManagementConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagementConfig {
    /// `host:port` of the daemon's management socket
    pub address: String,
    #[serde(default)]
    pub hold_release: bool,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7505".to_string(),
            hold_release: false,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl ManagementConfig {
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            command_timeout: Duration::from_secs(self.command_timeout_secs),
            hold_release: self.hold_release,
        }
    }
}

/// Subnets every client may reach; everything else is dropped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub subnets: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Prompted for at startup when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load from the working directory, then `~/.openvpn-mgmt/config.toml`,
    /// falling back to defaults.
    pub fn discover() -> Result<Self, ConfigError> {
        for path in Self::search_paths() {
            if path.exists() {
                info!("Loading config from {}", path.display());
                return Self::load(&path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".openvpn-mgmt").join("config.toml"));
        }
        paths
    }
}
