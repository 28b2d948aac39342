/*
    item.rs - StorageItem, the unit of persistence

    Invariants:
    - id and created_at never change after construction
    - modified_at >= created_at (mutators clamp to it)
    - is_encrypted is true iff content holds an encryption envelope
*/

use super::types::{ItemId, ProviderId, SyncStatus};
use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A user-authored note as persisted by the providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageItem {
    id: ItemId,

    pub title: String,

    pub content: String,

    created_at: DateTime<Utc>,

    /// Last content-affecting mutation; sole tie-breaker for conflicts
    modified_at: DateTime<Utc>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub is_encrypted: bool,

    /// Backend that owns the authoritative copy
    #[serde(default)]
    pub provider: ProviderId,

    #[serde(default)]
    pub sync_status: SyncStatus,
}

impl StorageItem {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        StorageItem {
            id: ItemId::generate(),
            title: title.into(),
            content: content.into(),
            created_at: now,
            modified_at: now,
            tags: BTreeSet::new(),
            is_encrypted: false,
            provider: ProviderId::default(),
            sync_status: SyncStatus::Pending,
        }
    }

    /// Build an item with a caller-chosen id, e.g. when an editor already allocated one
    pub fn with_id(id: ItemId, title: impl Into<String>, content: impl Into<String>) -> Self {
        StorageItem {
            id,
            ..StorageItem::new(title, content)
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn id(&self) -> ItemId {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Replace the content and bump `modified_at`
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = content.into();
        self.touch();
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
        self.touch();
    }

    /// Returns false if the tag was already present
    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        let inserted = self.tags.insert(tag.into());
        if inserted {
            self.touch();
        }
        inserted
    }

    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let removed = self.tags.remove(tag);
        if removed {
            self.touch();
        }
        removed
    }

    /// Mark the item as modified now
    pub fn touch(&mut self) {
        self.set_modified_at(Utc::now());
    }

    /// Set the modification time explicitly, clamped to `created_at`
    pub fn set_modified_at(&mut self, at: DateTime<Utc>) {
        self.modified_at = at.max(self.created_at);
    }

    /// Approximate payload size used for statistics and quota accounting
    pub fn size_bytes(&self) -> u64 {
        let tags: usize = self.tags.iter().map(|t| t.len()).sum();
        (self.title.len() + self.content.len() + tags) as u64
    }

    /// Equality over user-visible fields, ignoring replication bookkeeping
    pub fn same_content(&self, other: &StorageItem) -> bool {
        self.id == other.id
            && self.title == other.title
            && self.content == other.content
            && self.created_at == other.created_at
            && self.modified_at == other.modified_at
            && self.tags == other.tags
            && self.is_encrypted == other.is_encrypted
    }

    /// Check invariants of a record read back from a backend
    pub fn validate(&self) -> StorageResult<()> {
        if self.modified_at < self.created_at {
            return Err(StorageError::Serialization(format!(
                "item {} modified before it was created",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_item_timestamps() {
        let item = StorageItem::new("title", "body");
        assert_eq!(item.created_at(), item.modified_at());
        assert_eq!(item.sync_status, SyncStatus::Pending);
        assert!(!item.is_encrypted);
    }

    #[test]
    fn test_modified_at_never_precedes_created_at() {
        let mut item = StorageItem::new("t", "c");
        item.set_modified_at(item.created_at() - Duration::hours(1));
        assert_eq!(item.modified_at(), item.created_at());
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_mutations_bump_modified_at() {
        let mut item = StorageItem::new("t", "c");
        let later = item.created_at() + Duration::seconds(5);
        item.set_modified_at(later);
        assert_eq!(item.modified_at(), later);

        item.set_content("new body");
        assert!(item.modified_at() >= item.created_at());
        assert_eq!(item.content, "new body");
    }

    #[test]
    fn test_tags_have_set_semantics() {
        let mut item = StorageItem::new("t", "c").with_tags(["b", "a"]);
        assert!(!item.add_tag("a"));
        assert!(item.add_tag("c"));
        let tags: Vec<_> = item.tags.iter().cloned().collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert!(item.remove_tag("b"));
        assert!(!item.remove_tag("b"));
    }

    #[test]
    fn test_same_content_ignores_bookkeeping() {
        let item = StorageItem::new("t", "c");
        let mut copy = item.clone();
        copy.sync_status = SyncStatus::Synced;
        copy.provider = ProviderId::new("local-b");
        assert!(item.same_content(&copy));

        copy.content.push('!');
        assert!(!item.same_content(&copy));
    }

    #[test]
    fn test_serde_roundtrip_preserves_fields() {
        let item = StorageItem::new("t", "c").with_tags(["x"]);
        let json = serde_json::to_string(&item).unwrap();
        let back: StorageItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }
}
