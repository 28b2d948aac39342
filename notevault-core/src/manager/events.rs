//! Events broadcast by the storage manager

use crate::model::{ItemId, ProviderId};
use crate::sync::{ConflictChoice, SyncState};
use std::path::PathBuf;

/// Capacity of the event channel; slow subscribers observe `Lagged`
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Something observable happened inside the storage engine
#[derive(Debug, Clone, PartialEq)]
pub enum StorageEvent {
    ItemSaved { id: ItemId, provider: ProviderId },
    ItemDeleted { id: ItemId, existed: bool },
    /// The secondary write failed; the item is queued for the next sync
    ReplicationFailed {
        id: ItemId,
        provider: ProviderId,
        error: String,
    },
    ConflictDetected { id: ItemId },
    ConflictResolved { id: ItemId, choice: ConflictChoice },
    SyncStateChanged(SyncState),
    BackupCreated { provider: ProviderId, location: PathBuf },
    BackupRestored { provider: ProviderId, location: PathBuf },
    ItemsImported { count: usize },
    ConfigurationUpdated,
    AutoSaveFailed { id: ItemId, error: String },
}
