use std::{
    env, fmt,
    path::{Path, PathBuf},
};

use anyhow::Context;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::channel::DEFAULT_MAX_ATTEMPTS;

pub const STATE_FILE_KEY: &str = "PLUGIN_HOST_STATE_FILE";
pub const DOWNLOAD_DIR_KEY: &str = "PLUGIN_HOST_DOWNLOAD_DIR";
pub const LOG_LEVEL_KEY: &str = "PLUGIN_HOST_LOG_LEVEL";
pub const LOG_DIR_KEY: &str = "PLUGIN_HOST_LOG_DIR";
pub const RECONNECT_ATTEMPTS_KEY: &str = "PLUGIN_HOST_RECONNECT_ATTEMPTS";

/// Read-only key/value source the host settings are resolved from.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) if path.exists() => match dotenvy::from_path(path) {
                Ok(()) => debug!("Loaded .env from {}", path.display()),
                Err(e) => warn!("Could not load .env from {}: {e}", path.display()),
            },
            Some(path) => debug!("No .env at {}", path.display()),
            None => {}
        }
        Box::new(Self { env_file })
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(path) => format!("EnvConfigManager({})", path.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// Runtime settings of the host binary.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSettings {
    pub state_file: PathBuf,
    pub download_dir: PathBuf,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    pub reconnect_attempts: u32,
}

impl HostSettings {
    /// Read settings from `config`. Relative paths are taken from `root`.
    pub async fn load(config: &ConfigManager, root: &Path) -> anyhow::Result<Self> {
        let path = |value: Option<String>, default: &str| {
            let p = PathBuf::from(value.unwrap_or_else(|| default.to_string()));
            if p.is_absolute() { p } else { root.join(p) }
        };
        let reconnect_attempts = match config.0.get(RECONNECT_ATTEMPTS_KEY).await {
            Some(raw) => raw
                .trim()
                .parse::<u32>()
                .with_context(|| format!("{RECONNECT_ATTEMPTS_KEY} must be a number, got `{raw}`"))?,
            None => DEFAULT_MAX_ATTEMPTS,
        };
        let log_dir = config
            .0
            .get(LOG_DIR_KEY)
            .await
            .filter(|v| !v.trim().is_empty())
            .map(|v| path(Some(v), ""));

        Ok(Self {
            state_file: path(config.0.get(STATE_FILE_KEY).await, "state.json"),
            download_dir: path(config.0.get(DOWNLOAD_DIR_KEY).await, "downloads"),
            log_level: config
                .0
                .get(LOG_LEVEL_KEY)
                .await
                .unwrap_or_else(|| "info".to_string()),
            log_dir,
            reconnect_attempts,
        })
    }
}
