//! Configuration management for notevault
//!
//! This module provides file and environment based configuration with
//! support for defaults and validation.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

mod autosave;
mod error;
mod storage;

pub use autosave::AutoSaveConfig;
pub use error::ConfigError;
pub use storage::{keys as setting_keys, StorageConfiguration};

/// Main application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root under which provider directories are created
    pub data_dir: PathBuf,

    /// Storage engine configuration
    pub storage: StorageConfiguration,

    /// Auto-save queue configuration
    pub autosave: AutoSaveConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON formatting
    pub json_format: bool,

    /// Include target module
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Config {
    /// Default location of the data directory (`$HOME/.notevault`, else `./.notevault`)
    pub fn default_data_dir() -> PathBuf {
        env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".notevault")
    }

    /// Directory of a provider's store under the data directory
    pub fn provider_dir(&self, provider: &crate::model::ProviderId) -> PathBuf {
        self.data_dir.join(provider.as_str())
    }

    /// Load configuration from environment variables
    ///
    /// Environment variables follow the pattern: NOTEVAULT_<SECTION>_<KEY>
    /// Example: NOTEVAULT_STORAGE_SYNC_INTERVAL=10m
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self {
            data_dir: Self::default_data_dir(),
            ..Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay NOTEVAULT_* variables onto this configuration
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(dir) = env::var("NOTEVAULT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        // Storage config
        if let Ok(primary) = env::var("NOTEVAULT_STORAGE_PRIMARY") {
            self.storage.primary_provider = primary.into();
        }
        if let Ok(secondary) = env::var("NOTEVAULT_STORAGE_SECONDARY") {
            self.storage.secondary_provider = if secondary.is_empty() {
                None
            } else {
                Some(secondary.into())
            };
        }
        if let Ok(enabled) = env::var("NOTEVAULT_STORAGE_ENCRYPTION") {
            self.storage.encryption_enabled = enabled
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid encryption flag: {}", e)))?;
        }
        if let Ok(interval) = env::var("NOTEVAULT_STORAGE_SYNC_INTERVAL") {
            self.storage.sync_interval =
                storage::parse_duration("NOTEVAULT_STORAGE_SYNC_INTERVAL", &interval)?;
        }
        if let Ok(quota) = env::var("NOTEVAULT_STORAGE_QUOTA") {
            self.storage.storage_quota = Some(
                quota
                    .parse()
                    .map_err(|e| ConfigError::InvalidValue(format!("Invalid quota: {}", e)))?,
            );
        }

        // Auto-save config
        if let Ok(idle) = env::var("NOTEVAULT_AUTOSAVE_IDLE_THRESHOLD") {
            self.autosave.idle_threshold =
                storage::parse_duration("NOTEVAULT_AUTOSAVE_IDLE_THRESHOLD", &idle)?;
        }
        if let Ok(workers) = env::var("NOTEVAULT_AUTOSAVE_WORKERS") {
            self.autosave.worker_count = workers
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid worker count: {}", e)))?;
        }

        // Logging config
        if let Ok(level) = env::var("NOTEVAULT_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(json) = env::var("NOTEVAULT_LOG_JSON") {
            self.logging.json_format = json
                .parse()
                .map_err(|e| ConfigError::InvalidValue(format!("Invalid JSON flag: {}", e)))?;
        }

        Ok(())
    }

    /// Load configuration from file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;

        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.autosave.validate()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::FileWriteError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_validation() {
        let mut config = Config::default();
        config.autosave.max_items_per_batch = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notevault.toml");

        let mut config = Config::default();
        config.data_dir = dir.path().join("data");
        config.storage.secondary_provider = Some("local-b".into());
        config.storage.sync_interval = Duration::from_secs(120);
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notevault.toml");
        std::fs::write(
            &path,
            "[storage]\nprimary_provider = \"icloud\"\nsync_interval = \"10m\"\n",
        )
        .unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.storage.primary_provider.as_str(), "icloud");
        assert_eq!(loaded.storage.sync_interval, Duration::from_secs(600));
        assert_eq!(loaded.autosave, AutoSaveConfig::default());
    }
}
