/*
    types.rs - Common types for the item model

    Defines:
    - Item and provider identifiers
    - Backend kinds
    - Per-item sync status
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a stored item
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub Uuid);

impl ItemId {
    pub fn new(id: Uuid) -> Self {
        ItemId(id)
    }

    pub fn generate() -> Self {
        ItemId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(ItemId)
    }
}

/// Identifier of a registered storage backend ("local", "local-b", "dropbox", ...)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(pub String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        ProviderId(id.into())
    }

    /// The conventional id of the reference filesystem backend
    pub fn local() -> Self {
        ProviderId("local".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ProviderId {
    fn default() -> Self {
        ProviderId::local()
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(id: &str) -> Self {
        ProviderId(id.to_string())
    }
}

impl From<String> for ProviderId {
    fn from(id: String) -> Self {
        ProviderId(id)
    }
}

/// The fixed set of backend kinds a provider can declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Plain directory on local disk
    LocalFilesystem,
    /// Folder kept in sync by a cloud client (iCloud Drive, Dropbox, ...)
    CloudFolder,
    /// Third-party note service reached through an API
    NoteService,
    /// Volatile in-process store
    Memory,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::LocalFilesystem => "local_filesystem",
            ProviderKind::CloudFolder => "cloud_folder",
            ProviderKind::NoteService => "note_service",
            ProviderKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Replication state of a single item
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Uploading,
    Downloading,
    /// A second candidate version exists and must be resolved
    Conflict,
    Error(String),
}

impl SyncStatus {
    /// Payload-free discriminant, used as a histogram key
    pub fn kind(&self) -> SyncStatusKind {
        match self {
            SyncStatus::Synced => SyncStatusKind::Synced,
            SyncStatus::Pending => SyncStatusKind::Pending,
            SyncStatus::Uploading => SyncStatusKind::Uploading,
            SyncStatus::Downloading => SyncStatusKind::Downloading,
            SyncStatus::Conflict => SyncStatusKind::Conflict,
            SyncStatus::Error(_) => SyncStatusKind::Error,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SyncStatus::Conflict)
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        SyncStatus::Pending
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatus::Error(reason) => write!(f, "error({})", reason),
            other => write!(f, "{}", other.kind().as_str()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatusKind {
    Synced,
    Pending,
    Uploading,
    Downloading,
    Conflict,
    Error,
}

impl SyncStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatusKind::Synced => "synced",
            SyncStatusKind::Pending => "pending",
            SyncStatusKind::Uploading => "uploading",
            SyncStatusKind::Downloading => "downloading",
            SyncStatusKind::Conflict => "conflict",
            SyncStatusKind::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_id_parse_roundtrip() {
        let id = ItemId::generate();
        let parsed: ItemId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ItemId>().is_err());
    }

    #[test]
    fn test_sync_status_serde_shape() {
        let json = serde_json::to_string(&SyncStatus::Error("disk full".to_string())).unwrap();
        assert_eq!(json, r#"{"state":"error","reason":"disk full"}"#);

        let json = serde_json::to_string(&SyncStatus::Synced).unwrap();
        assert_eq!(json, r#"{"state":"synced"}"#);
    }

    #[test]
    fn test_sync_status_display() {
        assert_eq!(SyncStatus::Conflict.to_string(), "conflict");
        assert_eq!(SyncStatus::Error("x".into()).to_string(), "error(x)");
        assert_eq!(SyncStatus::Error("x".into()).kind(), SyncStatusKind::Error);
    }
}
