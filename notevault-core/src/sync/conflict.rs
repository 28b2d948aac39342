//! Conflict records and resolution choices

use crate::model::{ItemId, StorageItem};
use crate::provider::last_write_wins;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a surfaced conflict should be settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictChoice {
    /// Keep the primary provider's version
    KeepLocal,
    /// Keep the secondary provider's version
    KeepRemote,
    /// Newer `modified_at` wins, ties keep the primary's version
    LastWriteWins,
}

/// Two diverging plaintext versions of one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Version on the primary provider
    pub local: StorageItem,
    /// Version on the secondary provider
    pub remote: StorageItem,
    pub detected_at: DateTime<Utc>,
}

impl ConflictRecord {
    pub fn new(local: StorageItem, remote: StorageItem) -> Self {
        ConflictRecord {
            local,
            remote,
            detected_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ItemId {
        self.local.id()
    }

    /// The version a choice keeps
    pub fn pick(&self, choice: ConflictChoice) -> &StorageItem {
        match choice {
            ConflictChoice::KeepLocal => &self.local,
            ConflictChoice::KeepRemote => &self.remote,
            ConflictChoice::LastWriteWins => last_write_wins(&self.local, &self.remote),
        }
    }
}
