//! Storage engine for notevault: pluggable providers, replicated writes,
//! periodic sync with conflict handling, at-rest encryption and a
//! prioritized auto-save queue.

pub mod autosave;
pub mod config;
pub mod crypto;
pub mod error;
pub mod health;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod model;
pub mod provider;
pub mod shutdown;
pub mod stats;
pub mod sync;

pub use autosave::{AutoSaveQueue, CancelOutcome, EntryStatus, SavePriority};
pub use config::{AutoSaveConfig, Config, StorageConfiguration};
pub use crypto::{CredentialStore, EncryptionService, KdfParams, MemoryCredentialStore};
pub use error::{StorageError, StorageResult};
pub use logging::{init_logging, LogLevel};
pub use manager::{StorageEvent, StorageManager};
pub use model::{ItemId, ProviderId, ProviderKind, StorageItem, SyncStatus};
pub use provider::{LocalFileProvider, MemoryProvider, StorageProvider};
pub use stats::StorageStatistics;
pub use sync::{ConflictChoice, SyncReport, SyncState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = SavePriority::default();
        let _ = StorageConfiguration::new("local");
    }
}
