/*
    Item model - the persisted entity contract
*/

pub mod item;
pub mod types;

pub use item::StorageItem;
pub use types::{ItemId, ProviderId, ProviderKind, SyncStatus, SyncStatusKind};
