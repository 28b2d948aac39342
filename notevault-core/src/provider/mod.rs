//! StorageProvider trait - the backend contract
//!
//! Every backend (local disk, cloud-synced folder, note service) implements
//! the same capability set, so the manager and sync engine never inspect
//! concrete types.
//!
//! # Architecture
//!
//! ```text
//! StorageManager / SyncEngine
//!       |
//!       v
//! StorageProvider (trait)
//!       |
//!       +---> LocalFileProvider (one JSON record per item on disk)
//!       |
//!       +---> MemoryProvider (volatile, failure injection for tests)
//! ```

pub mod archive;
pub mod fs;
pub mod local;
pub mod memory;

use crate::error::StorageResult;
use crate::model::{ItemId, ProviderId, ProviderKind, StorageItem};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub use local::LocalFileProvider;
pub use memory::MemoryProvider;

/// Per-backend settings derived from the active `StorageConfiguration`
///
/// Pushed to every active provider whenever the configuration changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    /// Compress backup archives with zstd
    pub compress_backups: bool,

    /// Keep the previous record before overwriting it
    pub keep_versions: bool,

    /// Upper bound on retained versions per item
    pub max_versions: usize,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        ProviderOptions {
            compress_backups: false,
            keep_versions: false,
            max_versions: 10,
        }
    }
}

/// Last-write-wins by `modified_at`; an exact tie keeps `local`
pub fn last_write_wins<'a>(local: &'a StorageItem, remote: &'a StorageItem) -> &'a StorageItem {
    if remote.modified_at() > local.modified_at() {
        remote
    } else {
        local
    }
}

/// Backend-specific persistence of `StorageItem`s
///
/// Implementations must guarantee:
/// - `save` is atomic per id (no partial record visible to a concurrent `load`)
/// - `load` reports a missing record as `Ok(None)`, never as an error
/// - `delete` is idempotent and reports whether a record existed
/// - a failed `restore_backup` leaves the store as it was
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Registry identifier of this backend
    fn id(&self) -> &ProviderId;

    fn kind(&self) -> ProviderKind;

    /// Apply configuration-derived options; called on every configuration swap
    fn configure(&self, options: &ProviderOptions) {
        let _ = options;
    }

    /// Persist an item keyed by its id, overwriting any existing record
    async fn save(&self, item: &StorageItem) -> StorageResult<()>;

    async fn load(&self, id: &ItemId) -> StorageResult<Option<StorageItem>>;

    /// Snapshot of every readable record; order is unspecified
    async fn load_all(&self) -> StorageResult<Vec<StorageItem>>;

    /// Returns false if the id did not exist
    async fn delete(&self, id: &ItemId) -> StorageResult<bool>;

    /// Write a timestamped, self-contained archive of all items
    async fn create_backup(&self) -> StorageResult<PathBuf>;

    /// Replace the store's contents with an archive
    async fn restore_backup(&self, location: &Path) -> StorageResult<()>;

    /// Write every item as one JSON document
    async fn export_all(&self) -> StorageResult<PathBuf>;

    /// Import a JSON document; returns the number of items actually saved
    async fn import_from(&self, location: &Path) -> StorageResult<usize>;

    /// Pick the surviving version of two diverging copies
    fn resolve_conflict(&self, local: &StorageItem, remote: &StorageItem) -> StorageItem {
        last_write_wins(local, remote).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn test_trait_is_object_safe() {
        fn _accepts_provider(_provider: std::sync::Arc<dyn StorageProvider>) {}
    }

    #[test]
    fn test_newer_remote_wins() {
        let local = StorageItem::new("t", "local");
        let mut remote = local.clone();
        remote.content = "remote".to_string();
        remote.set_modified_at(local.modified_at() + Duration::seconds(1));

        assert_eq!(last_write_wins(&local, &remote).content, "remote");
    }

    #[test]
    fn test_tie_prefers_local() {
        let local = StorageItem::new("t", "local");
        let mut remote = local.clone();
        remote.content = "remote".to_string();

        assert_eq!(last_write_wins(&local, &remote).content, "local");
    }

    proptest! {
        #[test]
        fn prop_resolution_is_deterministic(offset_ms in -10_000i64..10_000) {
            let local = StorageItem::new("t", "local");
            let mut remote = local.clone();
            remote.content = "remote".to_string();
            remote.set_modified_at(local.modified_at() + Duration::milliseconds(offset_ms));

            let winner = last_write_wins(&local, &remote);
            if remote.modified_at() > local.modified_at() {
                prop_assert_eq!(&winner.content, "remote");
            } else {
                prop_assert_eq!(&winner.content, "local");
            }
            // Swapping arguments never flips a strict ordering
            let swapped = last_write_wins(&remote, &local);
            if remote.modified_at() != local.modified_at() {
                prop_assert_eq!(&swapped.content, &winner.content);
            }
        }
    }
}
