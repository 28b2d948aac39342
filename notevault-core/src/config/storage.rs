//! Storage configuration snapshot
//!
//! `StorageConfiguration` is immutable once handed to the manager; updates
//! replace the whole snapshot. It also round-trips through flat key/value
//! settings for hosts that persist preferences that way.

use super::ConfigError;
use crate::model::ProviderId;
use crate::provider::ProviderOptions;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Settings keys used by `to_settings` / `from_settings`
pub mod keys {
    pub const PRIMARY_PROVIDER: &str = "storage.primary_provider";
    pub const SECONDARY_PROVIDER: &str = "storage.secondary_provider";
    pub const ENCRYPTION_ENABLED: &str = "storage.encryption_enabled";
    pub const AUTO_BACKUP_ENABLED: &str = "storage.auto_backup_enabled";
    pub const AUTO_BACKUP_INTERVAL: &str = "storage.auto_backup_interval";
    pub const SYNC_INTERVAL: &str = "storage.sync_interval";
    pub const STATS_REFRESH_INTERVAL: &str = "storage.stats_refresh_interval";
    pub const STORAGE_QUOTA: &str = "storage.quota_bytes";
    pub const ENABLE_SYNC_CONFLICTS: &str = "storage.enable_sync_conflicts";
    pub const COMPRESSION_ENABLED: &str = "storage.compression_enabled";
    pub const VERSIONING_ENABLED: &str = "storage.versioning_enabled";
    pub const MAX_VERSIONS: &str = "storage.max_versions";
}

/// Which backends are active and how the engine treats them
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfiguration {
    /// Authoritative backend for reads
    pub primary_provider: ProviderId,

    /// Replication target
    pub secondary_provider: Option<ProviderId>,

    pub encryption_enabled: bool,

    pub auto_backup_enabled: bool,

    #[serde(with = "humantime_serde")]
    pub auto_backup_interval: Duration,

    /// Period of the background sync cycle
    #[serde(with = "humantime_serde")]
    pub sync_interval: Duration,

    /// Period of the statistics refresh tick
    #[serde(with = "humantime_serde")]
    pub stats_refresh_interval: Duration,

    /// Byte budget of the primary provider
    pub storage_quota: Option<u64>,

    /// Surface sync conflicts for manual resolution instead of auto-resolving
    pub enable_sync_conflicts: bool,

    pub compression_enabled: bool,

    pub versioning_enabled: bool,

    pub max_versions: usize,
}

impl Default for StorageConfiguration {
    fn default() -> Self {
        Self {
            primary_provider: ProviderId::local(),
            secondary_provider: None,
            encryption_enabled: false,
            auto_backup_enabled: false,
            auto_backup_interval: Duration::from_secs(24 * 3600),
            sync_interval: Duration::from_secs(300),
            stats_refresh_interval: Duration::from_secs(60),
            storage_quota: None,
            enable_sync_conflicts: false,
            compression_enabled: false,
            versioning_enabled: false,
            max_versions: 10,
        }
    }
}

impl StorageConfiguration {
    /// Configuration with a primary provider and defaults for the rest
    pub fn new(primary: impl Into<ProviderId>) -> Self {
        Self {
            primary_provider: primary.into(),
            ..Self::default()
        }
    }

    pub fn with_secondary(mut self, secondary: impl Into<ProviderId>) -> Self {
        self.secondary_provider = Some(secondary.into());
        self
    }

    pub fn with_encryption(mut self, enabled: bool) -> Self {
        self.encryption_enabled = enabled;
        self
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_quota(mut self, quota: Option<u64>) -> Self {
        self.storage_quota = quota;
        self
    }

    pub fn with_sync_conflicts(mut self, enabled: bool) -> Self {
        self.enable_sync_conflicts = enabled;
        self
    }

    /// Every provider id this configuration activates
    pub fn active_providers(&self) -> Vec<ProviderId> {
        let mut providers = vec![self.primary_provider.clone()];
        if let Some(secondary) = &self.secondary_provider {
            providers.push(secondary.clone());
        }
        providers
    }

    /// Options pushed to each active provider
    pub fn provider_options(&self) -> ProviderOptions {
        ProviderOptions {
            compress_backups: self.compression_enabled,
            keep_versions: self.versioning_enabled,
            max_versions: self.max_versions,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.primary_provider.as_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "primary_provider must not be empty".to_string(),
            ));
        }

        if let Some(secondary) = &self.secondary_provider {
            if secondary == &self.primary_provider {
                return Err(ConfigError::ValidationFailed(format!(
                    "secondary_provider must differ from primary ({})",
                    secondary
                )));
            }
            if secondary.as_str().is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "secondary_provider must not be empty".to_string(),
                ));
            }
        }

        if self.sync_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "sync_interval must be greater than 0".to_string(),
            ));
        }

        if self.stats_refresh_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "stats_refresh_interval must be greater than 0".to_string(),
            ));
        }

        if self.auto_backup_enabled && self.auto_backup_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "auto_backup_interval must be greater than 0".to_string(),
            ));
        }

        if self.storage_quota == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "storage_quota must be greater than 0 when set".to_string(),
            ));
        }

        if self.versioning_enabled && self.max_versions == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_versions must be greater than 0 when versioning is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Flatten into key/value settings
    ///
    /// Durations are written in humantime form ("5m"); absent optionals are
    /// written as empty strings.
    pub fn to_settings(&self) -> BTreeMap<String, String> {
        let mut settings = BTreeMap::new();
        let mut put = |key: &str, value: String| {
            settings.insert(key.to_string(), value);
        };

        put(keys::PRIMARY_PROVIDER, self.primary_provider.to_string());
        put(
            keys::SECONDARY_PROVIDER,
            self.secondary_provider
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default(),
        );
        put(keys::ENCRYPTION_ENABLED, self.encryption_enabled.to_string());
        put(keys::AUTO_BACKUP_ENABLED, self.auto_backup_enabled.to_string());
        put(
            keys::AUTO_BACKUP_INTERVAL,
            humantime::format_duration(self.auto_backup_interval).to_string(),
        );
        put(
            keys::SYNC_INTERVAL,
            humantime::format_duration(self.sync_interval).to_string(),
        );
        put(
            keys::STATS_REFRESH_INTERVAL,
            humantime::format_duration(self.stats_refresh_interval).to_string(),
        );
        put(
            keys::STORAGE_QUOTA,
            self.storage_quota.map(|q| q.to_string()).unwrap_or_default(),
        );
        put(
            keys::ENABLE_SYNC_CONFLICTS,
            self.enable_sync_conflicts.to_string(),
        );
        put(keys::COMPRESSION_ENABLED, self.compression_enabled.to_string());
        put(keys::VERSIONING_ENABLED, self.versioning_enabled.to_string());
        put(keys::MAX_VERSIONS, self.max_versions.to_string());

        settings
    }

    /// Rebuild from key/value settings; missing keys keep their defaults
    pub fn from_settings(settings: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let get = |key: &str| settings.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        if let Some(primary) = get(keys::PRIMARY_PROVIDER) {
            config.primary_provider = ProviderId::new(primary);
        }
        config.secondary_provider = get(keys::SECONDARY_PROVIDER).map(ProviderId::new);

        if let Some(v) = get(keys::ENCRYPTION_ENABLED) {
            config.encryption_enabled = parse_bool(keys::ENCRYPTION_ENABLED, v)?;
        }
        if let Some(v) = get(keys::AUTO_BACKUP_ENABLED) {
            config.auto_backup_enabled = parse_bool(keys::AUTO_BACKUP_ENABLED, v)?;
        }
        if let Some(v) = get(keys::AUTO_BACKUP_INTERVAL) {
            config.auto_backup_interval = parse_duration(keys::AUTO_BACKUP_INTERVAL, v)?;
        }
        if let Some(v) = get(keys::SYNC_INTERVAL) {
            config.sync_interval = parse_duration(keys::SYNC_INTERVAL, v)?;
        }
        if let Some(v) = get(keys::STATS_REFRESH_INTERVAL) {
            config.stats_refresh_interval = parse_duration(keys::STATS_REFRESH_INTERVAL, v)?;
        }
        config.storage_quota = get(keys::STORAGE_QUOTA)
            .map(|v| {
                v.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue(format!("{}: {}", keys::STORAGE_QUOTA, e))
                })
            })
            .transpose()?;
        if let Some(v) = get(keys::ENABLE_SYNC_CONFLICTS) {
            config.enable_sync_conflicts = parse_bool(keys::ENABLE_SYNC_CONFLICTS, v)?;
        }
        if let Some(v) = get(keys::COMPRESSION_ENABLED) {
            config.compression_enabled = parse_bool(keys::COMPRESSION_ENABLED, v)?;
        }
        if let Some(v) = get(keys::VERSIONING_ENABLED) {
            config.versioning_enabled = parse_bool(keys::VERSIONING_ENABLED, v)?;
        }
        if let Some(v) = get(keys::MAX_VERSIONS) {
            config.max_versions = v.parse().map_err(|e| {
                ConfigError::InvalidValue(format!("{}: {}", keys::MAX_VERSIONS, e))
            })?;
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value
        .parse()
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e)))
}

pub(crate) fn parse_duration(key: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value)
        .map_err(|e| ConfigError::InvalidValue(format!("{}: {}", key, e)))
}
