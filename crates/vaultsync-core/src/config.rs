//! Application configuration management.
//!
//! This module handles loading and saving the application configuration,
//! which includes the API endpoint, request timeout, data directory, last
//! used username and default settings.
//!
//! Configuration is stored at `~/.config/vaultsync/config.json`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::Settings;

/// Application name used for config/data directory paths
pub const APP_NAME: &str = "vaultsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Database file name inside the data directory
const STORE_FILE: &str = "vault.db";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "VAULTSYNC_API_URL";

const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub last_username: Option<String>,
    /// Settings used until the options page pushes its own.
    pub settings: Settings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            data_dir: None,
            last_username: None,
            settings: Settings::default(),
        }
    }
}

impl Config {
    /// Load the config file (defaults if missing), then apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Invalid config file {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(API_URL_ENV) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    pub fn store_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(STORE_FILE))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://vault.example.com"}"#).unwrap();
        assert_eq!(config.api_base_url, "https://vault.example.com");
        assert_eq!(config.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn test_explicit_data_dir_wins() {
        let config = Config {
            data_dir: Some(PathBuf::from("/tmp/vaultsync-test")),
            ..Default::default()
        };
        assert_eq!(config.store_path().unwrap(), PathBuf::from("/tmp/vaultsync-test/vault.db"));
    }
}
