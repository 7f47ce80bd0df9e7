//! Global CLI configuration management
//!
//! Stores the control-plane URL, access token and SSH key directory in
//! ~/.playctl/config.json

use anyhow::{Context, Result};
use playctl_client::{ClientConfig, DEFAULT_BASE_URL};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONFIG_DIR: &str = ".playctl";

/// Global CLI configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayctlConfig {
    /// Control-plane base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    /// Access token sent as a bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    /// Directory holding the SSH identity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_dir: Option<PathBuf>,
}

impl PlayctlConfig {
    /// Build the client config, letting explicit values win over stored ones
    pub fn client_config(&self, base_url: Option<&str>, token: Option<&str>) -> ClientConfig {
        let base_url = base_url
            .or(self.base_url.as_deref())
            .unwrap_or(DEFAULT_BASE_URL);
        let mut config = ClientConfig::new(base_url);
        if let Some(token) = token.or(self.access_token.as_deref()) {
            config = config.with_access_token(token);
        }
        config
    }

    /// Configured SSH directory, or `~/.playctl/ssh`
    pub fn ssh_dir(&self) -> Result<PathBuf> {
        match &self.ssh_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(ConfigManager::config_dir()?.join("ssh")),
        }
    }
}

/// Configuration manager
pub struct ConfigManager;

impl ConfigManager {
    fn config_dir() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home.join(CONFIG_DIR))
    }

    /// Get the config file path
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load the configuration from disk
    pub fn load() -> Result<PlayctlConfig> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load the configuration from `path`, defaulting when it does not exist
    pub fn load_from(path: &Path) -> Result<PlayctlConfig> {
        if !path.exists() {
            return Ok(PlayctlConfig::default());
        }

        let json =
            fs::read_to_string(path).context(format!("Failed to read config file: {:?}", path))?;

        serde_json::from_str(&json).context(format!("Failed to parse config file: {:?}", path))
    }

    /// Save the configuration to disk
    pub fn save(config: &PlayctlConfig) -> Result<()> {
        Self::save_to(&Self::config_path()?, config)
    }

    pub fn save_to(path: &Path, config: &PlayctlConfig) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context(format!("Failed to create config directory: {:?}", parent))?;
        }

        let json = serde_json::to_string_pretty(config).context("Failed to serialize config")?;

        fs::write(path, json).context(format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Set the default access token
    pub fn set_token(token: String) -> Result<()> {
        let mut config = Self::load()?;
        config.access_token = Some(token);
        Self::save(&config)
    }

    /// Set the control-plane base URL
    pub fn set_base_url(base_url: String) -> Result<()> {
        let mut config = Self::load()?;
        config.base_url = Some(base_url);
        Self::save(&config)
    }
}
