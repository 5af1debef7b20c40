//! Start-up configuration: a YAML file plus secrets from the environment

use crate::acl::PermissionConfig;
use crate::cache::CacheConfig;
use crate::detector::GuildPolicy;
use crate::kv::KvConfig;
use crate::notify::NotifyConfig;
use crate::punish::DispatcherConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Used when `ANTINUKE_CONFIG` is unset
pub const DEFAULT_CONFIG_PATH: &str = "config/antinuke.yaml";
pub const CONFIG_PATH_VAR: &str = "ANTINUKE_CONFIG";
pub const TOKEN_VAR: &str = "DISCORD_TOKEN";
pub const REDIS_PASSWORD_VAR: &str = "REDIS_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{TOKEN_VAR} must be set")]
    MissingToken,
}

/// Where the shared KV store lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvBackend {
    #[default]
    Redis,
    /// In-process only; nothing is shared between instances
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Bot token, never read from the file
    #[serde(skip)]
    pub token: String,
    pub kv_backend: KvBackend,
    pub kv: KvConfig,
    pub cache: CacheConfig,
    pub permissions: PermissionConfig,
    pub dispatcher: DispatcherConfig,
    pub notify: NotifyConfig,
    /// Anti-nuke policy per guild id
    pub guilds: HashMap<u64, GuildPolicy>,
}

impl CoreConfig {
    /// Load from `ANTINUKE_CONFIG` (or the default path) and the process
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file exists but cannot be read or parsed,
    /// or if `DISCORD_TOKEN` is missing.
    pub async fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        let config = Self::from_path(&path).await?;
        config.with_env(|key| std::env::var(key).ok())
    }

    /// Parse a config file. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Read` or `ConfigError::Parse`.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// # Errors
    ///
    /// Returns the YAML error for malformed input.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Fill secrets from `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingToken` when no non-empty token is found.
    pub fn with_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.token = lookup(TOKEN_VAR)
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::MissingToken)?;
        if let Some(password) = lookup(REDIS_PASSWORD_VAR).filter(|p| !p.is_empty()) {
            self.kv.password = Some(password);
        }
        Ok(self)
    }
}
