// Configuration management for the fsend CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/fsend/config.json
// - Linux: ~/.config/fsend/config.json
// - Windows: %APPDATA%\fsend\config.json

use anyhow::{Context, Result};
use fsend_core::{ServerConfig, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Server that client commands talk to
    pub server_addr: String,

    /// Listen address and storage root for `fsend serve`
    pub server: ServerConfig,

    /// Copy buffer size requested on upload (0 = server default)
    pub buffer_hint: u32,

    /// Where the local identifier is kept
    pub uid_file: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", DEFAULT_PORT),
            server: ServerConfig::default(),
            buffer_hint: 0,
            uid_file: None,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("fsend");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    /// Get the data directory path (cross-platform)
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_local_dir()
            .context("Failed to determine data directory")?
            .join("fsend");

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        Ok(data_dir)
    }

    /// Get the config file path
    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the user config file, creating it with defaults if missing
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save config to the user config file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Path of the identifier file, falling back to the data directory
    pub fn uid_path(&self) -> Result<PathBuf> {
        match &self.uid_file {
            Some(path) => Ok(PathBuf::from(path)),
            None => Ok(Self::data_dir()?.join("uid")),
        }
    }

    /// Server settings for `fsend serve`
    pub fn server_config(&self) -> ServerConfig {
        self.server.clone()
    }

    /// Set a config value
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "server_addr" => {
                self.server_addr = value.to_string();
            }
            "listen_addr" => {
                self.server.listen_addr = value
                    .parse::<SocketAddr>()
                    .context("Invalid socket address")?;
            }
            "storage_root" => {
                if value.is_empty() {
                    anyhow::bail!("storage_root cannot be empty");
                }
                self.server.storage_root = PathBuf::from(value);
            }
            "buffer_hint" => {
                self.buffer_hint = value.parse().context("Invalid number")?;
            }
            "uid_file" => {
                self.uid_file = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    /// Get a config value
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "server_addr" => Some(self.server_addr.clone()),
            "listen_addr" => Some(self.server.listen_addr.to_string()),
            "storage_root" => Some(self.server.storage_root.display().to_string()),
            "buffer_hint" => Some(self.buffer_hint.to_string()),
            "uid_file" => self.uid_file.clone(),
            _ => None,
        }
    }

    /// List all config values
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("server_addr".to_string(), self.server_addr.clone()),
            ("listen_addr".to_string(), self.server.listen_addr.to_string()),
            (
                "storage_root".to_string(),
                self.server.storage_root.display().to_string(),
            ),
            ("buffer_hint".to_string(), self.buffer_hint.to_string()),
            (
                "uid_file".to_string(),
                self.uid_file.clone().unwrap_or_else(|| "(auto)".to_string()),
            ),
        ]
    }
}
