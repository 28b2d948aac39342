/*
    Storage statistics - derived snapshot of provider and queue state

    `compute` is the only place statistics fields are written; the manager
    feeds it provider scans plus bookkeeping and publishes the result.
*/

mod counters;

pub use counters::{AutoSaveSnapshot, Counters};

use crate::model::{ProviderId, StorageItem, SyncStatusKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time view of the storage engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageStatistics {
    /// Items on the primary provider
    pub total_items: usize,

    /// Payload bytes on the primary provider
    pub total_bytes: u64,

    pub bytes_by_provider: BTreeMap<ProviderId, u64>,

    /// Histogram of primary items by sync status
    pub items_by_status: BTreeMap<SyncStatusKind, usize>,

    pub last_backup: Option<DateTime<Utc>>,

    pub last_sync: Option<DateTime<Utc>>,

    /// Error of the most recent sync cycle, cleared by the next success
    pub last_sync_error: Option<String>,

    pub used_bytes: u64,

    /// Remaining quota; `None` when no quota is configured
    pub available_bytes: Option<u64>,

    /// Used share of the quota in percent
    pub quota_percentage: Option<f64>,

    pub pending_conflicts: usize,

    pub autosave: AutoSaveSnapshot,

    pub computed_at: Option<DateTime<Utc>>,
}

impl StorageStatistics {
    /// True once a configured quota is fully used
    pub fn quota_exhausted(&self) -> bool {
        self.available_bytes == Some(0)
    }

    pub fn status_count(&self, kind: SyncStatusKind) -> usize {
        self.items_by_status.get(&kind).copied().unwrap_or(0)
    }
}

/// Everything `compute` needs
#[derive(Debug, Default)]
pub struct StatisticsInput<'a> {
    pub primary: Option<&'a ProviderId>,
    /// Items per scanned provider
    pub scans: Vec<(&'a ProviderId, &'a [StorageItem])>,
    pub quota: Option<u64>,
    pub last_backup: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_error: Option<String>,
    pub pending_conflicts: usize,
    pub autosave: AutoSaveSnapshot,
}

fn bytes_of(items: &[StorageItem]) -> u64 {
    items.iter().map(StorageItem::size_bytes).sum()
}

/// Derive statistics from provider scans and bookkeeping
pub fn compute(input: StatisticsInput<'_>) -> StorageStatistics {
    let bytes_by_provider: BTreeMap<ProviderId, u64> = input
        .scans
        .iter()
        .map(|(provider, items)| ((*provider).clone(), bytes_of(items)))
        .collect();

    let primary_items: &[StorageItem] = input
        .primary
        .and_then(|primary| {
            input
                .scans
                .iter()
                .find(|(provider, _)| *provider == primary)
                .map(|(_, items)| *items)
        })
        .unwrap_or(&[]);

    let mut items_by_status = BTreeMap::new();
    for item in primary_items {
        *items_by_status.entry(item.sync_status.kind()).or_insert(0) += 1;
    }

    let used_bytes = bytes_of(primary_items);
    let available_bytes = input.quota.map(|quota| quota.saturating_sub(used_bytes));
    let quota_percentage = input
        .quota
        .map(|quota| used_bytes as f64 / quota as f64 * 100.0);

    StorageStatistics {
        total_items: primary_items.len(),
        total_bytes: used_bytes,
        bytes_by_provider,
        items_by_status,
        last_backup: input.last_backup,
        last_sync: input.last_sync,
        last_sync_error: input.last_sync_error,
        used_bytes,
        available_bytes,
        quota_percentage,
        pending_conflicts: input.pending_conflicts,
        autosave: input.autosave,
        computed_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;

    #[test]
    fn test_empty_input() {
        let stats = compute(StatisticsInput::default());
        assert_eq!(stats.total_items, 0);
        assert_eq!(stats.used_bytes, 0);
        assert!(stats.quota_percentage.is_none());
        assert!(stats.computed_at.is_some());
    }

    #[test]
    fn test_breakdown_and_histogram() {
        let local = ProviderId::local();
        let remote = ProviderId::new("local-b");

        let mut conflicted = StorageItem::new("ab", "cd");
        conflicted.sync_status = SyncStatus::Conflict;
        let mut synced = StorageItem::new("x", "yz");
        synced.sync_status = SyncStatus::Synced;
        let primary_items = vec![conflicted, synced.clone()];
        let secondary_items = vec![synced];

        let stats = compute(StatisticsInput {
            primary: Some(&local),
            scans: vec![(&local, &primary_items), (&remote, &secondary_items)],
            quota: Some(14),
            ..StatisticsInput::default()
        });

        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.used_bytes, 7);
        assert_eq!(stats.bytes_by_provider[&remote], 3);
        assert_eq!(stats.status_count(SyncStatusKind::Conflict), 1);
        assert_eq!(stats.status_count(SyncStatusKind::Synced), 1);
        assert_eq!(stats.available_bytes, Some(7));
        assert_eq!(stats.quota_percentage, Some(50.0));
        assert!(!stats.quota_exhausted());
    }

    #[test]
    fn test_over_quota_is_exhausted() {
        let local = ProviderId::local();
        let items = vec![StorageItem::new("title", "much longer content")];
        let stats = compute(StatisticsInput {
            primary: Some(&local),
            scans: vec![(&local, &items)],
            quota: Some(4),
            ..StatisticsInput::default()
        });

        assert!(stats.quota_exhausted());
        assert!(stats.quota_percentage.unwrap() > 100.0);
    }
}
