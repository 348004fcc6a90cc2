//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use account_pool::ManagerConfig;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Directory of credential JSON files.
    pub auth_dir: PathBuf,
    /// Bearer key required on management endpoints; empty disables auth.
    #[serde(default)]
    pub management_key: String,
    #[serde(default)]
    pub pool: ManagerConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub refresh: RefreshSection,
    #[serde(default)]
    pub prompt_queue: PromptQueueSection,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub max_wait_secs: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_wait_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RefreshSection {
    pub interval_secs: u64,
    pub threshold_secs: u64,
}

impl Default for RefreshSection {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            threshold_secs: 900,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PromptQueueSection {
    /// Journal directory; defaults to the queue's own resolution order.
    pub store_dir: Option<PathBuf>,
    pub session_queue_size: Option<usize>,
}

impl Config {
    /// Load configuration from a TOML file, then validate.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| common::Error::Config(format!("parsing config: {e}")))?;

        if config.auth_dir.as_os_str().is_empty() {
            return Err(common::Error::Config("auth_dir must be set".into()));
        }
        if config.retry.max_attempts == 0 {
            return Err(common::Error::Config(
                "retry.max_attempts must be greater than 0".into(),
            ));
        }
        if config.refresh.interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh.interval_secs must be greater than 0".into(),
            ));
        }
        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gateway.toml")
    }
}
