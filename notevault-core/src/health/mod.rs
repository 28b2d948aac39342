//! Health derived from storage statistics

use crate::stats::StorageStatistics;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Quota usage above which storage is reported degraded
pub const QUOTA_WARNING_PERCENT: f64 = 90.0;

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
}

impl HealthCheck {
    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ComponentHealth {
    /// Create a healthy component
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    /// Create a degraded component
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    /// Create an unhealthy component
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// Built-in health checks
pub mod checks {
    use super::*;

    pub fn check_quota(stats: &StorageStatistics) -> ComponentHealth {
        match stats.quota_percentage {
            _ if stats.quota_exhausted() => ComponentHealth::unhealthy("quota", "Storage quota exhausted"),
            Some(percent) if percent > QUOTA_WARNING_PERCENT => {
                ComponentHealth::degraded("quota", format!("Quota usage at {:.1}%", percent))
            }
            _ => ComponentHealth::healthy("quota"),
        }
    }

    pub fn check_sync(stats: &StorageStatistics) -> ComponentHealth {
        match &stats.last_sync_error {
            Some(error) => ComponentHealth::unhealthy("sync", format!("Last sync failed: {}", error)),
            None => ComponentHealth::healthy("sync"),
        }
    }

    pub fn check_conflicts(stats: &StorageStatistics) -> ComponentHealth {
        if stats.pending_conflicts > 0 {
            ComponentHealth::degraded(
                "conflicts",
                format!("{} conflicts awaiting resolution", stats.pending_conflicts),
            )
        } else {
            ComponentHealth::healthy("conflicts")
        }
    }

    pub fn check_autosave(stats: &StorageStatistics) -> ComponentHealth {
        if stats.autosave.failed > 0 {
            ComponentHealth::degraded(
                "autosave",
                format!("{} auto-saves failed", stats.autosave.failed),
            )
        } else {
            ComponentHealth::healthy("autosave")
        }
    }
}

/// Overall health: the worst component status wins
pub fn assess(stats: &StorageStatistics) -> HealthCheck {
    let components = vec![
        checks::check_quota(stats),
        checks::check_sync(stats),
        checks::check_conflicts(stats),
        checks::check_autosave(stats),
    ];

    let status = components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthStatus::Healthy);

    HealthCheck {
        status,
        timestamp: SystemTime::now(),
        components,
    }
}
