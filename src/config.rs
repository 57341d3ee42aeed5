//! # Configuration
//!
//! One TOML file with three sections. Missing keys fall back to their
//! defaults, and a missing file is created with the defaults on first start.
//!
//! ```toml
//! [broker]
//! url = "ws://localhost:8008"
//! vpn_name = "default"
//! username = "rates-subman"
//! password = ""
//! connect_retries = 3
//! keep_alive_secs = 30
//!
//! [client]
//! match_mode = "compat"
//! operation_timeout_ms = 1000
//!
//! [subscription_manager]
//! request_topic = "rates/v1/subman/request/*"
//! grants = ["rates/v1/bill/>", "rates/v1/bond/>", "rates/v1/note/>"]
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::client::ClientSettings;
use crate::topic::MatchMode;

const CONFIG_DIR: &str = ".config/rates-pubsub";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub vpn_name: String,
    pub username: String,
    pub password: String,
    pub client_name: Option<String>,
    pub connect_retries: u32,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            url: "ws://localhost:8008".to_string(),
            vpn_name: "default".to_string(),
            username: "rates-subman".to_string(),
            password: String::new(),
            client_name: None,
            connect_retries: 3,
            keep_alive_secs: 30,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub match_mode: MatchMode,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            match_mode: MatchMode::Compat,
            connect_timeout_ms: 10_000,
            operation_timeout_ms: 1_000,
            publish_timeout_ms: 5_000,
            request_timeout_ms: 2_000,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct SubManagerConfig {
    /// Filter the service listens on for subscription requests
    pub request_topic: String,
    /// Filters granted to every requester
    pub grants: Vec<String>,
}

impl Default for SubManagerConfig {
    fn default() -> Self {
        SubManagerConfig {
            request_topic: "rates/v1/subman/request/*".to_string(),
            grants: vec![
                "rates/v1/bill/>".to_string(),
                "rates/v1/bond/>".to_string(),
                "rates/v1/note/>".to_string(),
            ],
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub client: ClientConfig,
    pub subscription_manager: SubManagerConfig,
}

impl Config {
    /// `~/.config/rates-pubsub/config.toml`, relative to the working
    /// directory when no home directory is known.
    pub fn default_path() -> PathBuf {
        let mut path = dirs::home_dir().unwrap_or_else(|| {
            warn!("Could not determine home directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await.map_err(io_err)
    }

    /// Loads `path`, writing a default config there first if it is missing.
    pub async fn ensure_default(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        if exists {
            return Self::load(path).await;
        }

        info!("No config at {}, writing defaults", path.display());
        let config = Config::default();
        config.save(path).await?;
        Ok(config)
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            match_mode: self.client.match_mode,
            client_name: self.broker.client_name.clone(),
            connect_retries: self.broker.connect_retries,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_millis(self.client.connect_timeout_ms),
            operation_timeout: Duration::from_millis(self.client.operation_timeout_ms),
            publish_timeout: Duration::from_millis(self.client.publish_timeout_ms),
            request_timeout: Duration::from_millis(self.client.request_timeout_ms),
        }
    }
}
