//! # btrdiff-config
//!
//! Configuration management for btrdiff.
//!
//! Loads configuration from:
//! 1. `~/.btrdiff/config.toml` (global)
//! 2. `.btrdiff/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

pub use logging::{init_logging, Component, LogLevel};

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> =
    Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

pub const ENV_STORAGE_DIR: &str = "BTRDIFF_STORAGE_DIR";
pub const ENV_STORAGE_ENGINE: &str = "BTRDIFF_STORAGE_ENGINE";
pub const ENV_MAX_COMMAND_LEN: &str = "BTRDIFF_MAX_COMMAND_LEN";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML render error: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub decode: DecodeConfig,
    pub filters: FilterConfig,
    pub log: LogConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        let project = Path::new(".btrdiff/config.toml");
        let mut config = Self::load_from(global.as_deref(), Some(project))?;
        config.apply_env_overrides(|var| std::env::var(var).ok())?;
        Ok(config)
    }

    /// Layer `project` over `global`; missing files are skipped.
    pub fn load_from(global: Option<&Path>, project: Option<&Path>) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in [global, project].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.btrdiff/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".btrdiff/config.toml"))
    }

    /// Apply environment variable overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(ENV_STORAGE_DIR) {
            self.storage.base_dir = PathBuf::from(dir);
        }
        if let Some(engine) = lookup(ENV_STORAGE_ENGINE) {
            self.storage.engine = engine;
        }
        if let Some(len) = lookup(ENV_MAX_COMMAND_LEN) {
            self.decode.max_command_len = len.parse().map_err(|_| ConfigError::InvalidEnv {
                var: ENV_MAX_COMMAND_LEN,
                value: len,
            })?;
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(&Config::default())?)
    }
}

/// Later keys win; nested tables merge instead of replacing each other.
fn merge_tables(base: &mut toml::Table, layer: toml::Table) {
    for (key, value) in layer {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming)
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Blob storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Engine name: filesystem or cas
    pub engine: String,
    /// Root directory of the engine
    pub base_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: "filesystem".to_string(),
            base_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".btrdiff/blobs"),
        }
    }
}

/// Send-stream decoding limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// Largest command payload accepted, in bytes
    pub max_command_len: u32,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            max_command_len: btrdiff_stream::DEFAULT_MAX_COMMAND_LEN,
        }
    }
}

/// Command filters applied before replay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Drop `security.selinux` xattrs
    pub drop_selinux_xattrs: bool,
    /// Only drop labels with these values (empty = any)
    pub selinux_xattr_values: Vec<String>,
}

impl FilterConfig {
    /// Label values to drop, or `None` when the filter is off.
    pub fn selinux_values(&self) -> Option<Vec<Vec<u8>>> {
        self.drop_selinux_xattrs.then(|| {
            self.selinux_xattr_values
                .iter()
                .map(|v| v.as_bytes().to_vec())
                .collect()
        })
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.storage.engine, "filesystem");
        assert!(config.storage.base_dir.ends_with(".btrdiff/blobs"));
        assert_eq!(config.decode.max_command_len, 16 * 1024 * 1024);
        assert_eq!(config.filters.selinux_values(), None);
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml().unwrap();
        assert!(toml_str.contains("[storage]"));
        assert!(toml_str.contains("[decode]"));
        assert!(toml_str.contains("[filters]"));
        assert!(toml_str.contains("engine = \"filesystem\""));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env_overrides(|var| match var {
                ENV_STORAGE_DIR => Some("/srv/blobs".to_string()),
                ENV_STORAGE_ENGINE => Some("cas".to_string()),
                ENV_MAX_COMMAND_LEN => Some("4096".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.storage.base_dir, PathBuf::from("/srv/blobs"));
        assert_eq!(config.storage.engine, "cas");
        assert_eq!(config.decode.max_command_len, 4096);

        let err = config
            .apply_env_overrides(|var| (var == ENV_MAX_COMMAND_LEN).then(|| "big".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn test_selinux_values() {
        let filters = FilterConfig {
            drop_selinux_xattrs: true,
            selinux_xattr_values: vec!["system_u:object_r:root_t:s0".to_string()],
        };
        assert_eq!(
            filters.selinux_values(),
            Some(vec![b"system_u:object_r:root_t:s0".to_vec()])
        );
    }
}
