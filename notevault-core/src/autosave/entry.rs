//! Auto-save queue entries

use crate::model::{ItemId, StorageItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Flush priority; declaration order is ascending
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SavePriority {
    Low,
    #[default]
    Normal,
    High,
    /// Skips the idle debounce
    Critical,
}

impl SavePriority {
    /// One tier up, saturating at `Critical`
    pub fn promoted(self) -> Self {
        match self {
            SavePriority::Low => SavePriority::Normal,
            SavePriority::Normal => SavePriority::High,
            SavePriority::High | SavePriority::Critical => SavePriority::Critical,
        }
    }
}

impl fmt::Display for SavePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SavePriority::Low => "low",
            SavePriority::Normal => "normal",
            SavePriority::High => "high",
            SavePriority::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Queued,
    Saving,
    Saved,
    Cancelled,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EntryStatus::Saved | EntryStatus::Cancelled | EntryStatus::Failed
        )
    }
}

/// A dirty item waiting to be flushed
#[derive(Debug, Clone)]
pub struct AutoSaveEntry {
    pub item: StorageItem,
    pub priority: SavePriority,
    pub status: EntryStatus,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    pub last_error: Option<String>,
    pub(crate) seq: u64,
    pub(crate) last_edit: Instant,
    pub(crate) next_attempt: Instant,
    pub(crate) waiting_since: Instant,
}

impl AutoSaveEntry {
    pub(crate) fn new(item: StorageItem, priority: SavePriority, seq: u64, now: Instant) -> Self {
        AutoSaveEntry {
            item,
            priority,
            status: EntryStatus::Queued,
            enqueued_at: Utc::now(),
            retries: 0,
            last_error: None,
            seq,
            last_edit: now,
            next_attempt: now,
            waiting_since: now,
        }
    }

    pub fn id(&self) -> ItemId {
        self.item.id()
    }

    /// Replace the pending content with a newer edit
    pub(crate) fn supersede(&mut self, item: StorageItem, priority: SavePriority, now: Instant) {
        self.item = item;
        self.priority = self.priority.max(priority);
        self.last_edit = now;
    }

    /// Ready to flush: queued, out of backoff and idle long enough
    ///
    /// `force` ignores both the debounce and the backoff.
    pub(crate) fn is_eligible(&self, now: Instant, idle_threshold: Duration, force: bool) -> bool {
        if self.status != EntryStatus::Queued {
            return false;
        }
        if force {
            return true;
        }
        if now < self.next_attempt {
            return false;
        }
        self.priority == SavePriority::Critical
            || now.saturating_duration_since(self.last_edit) >= idle_threshold
    }

    pub(crate) fn is_starving(&self, now: Instant, promotion_after: Duration) -> bool {
        self.priority < SavePriority::Critical
            && now.saturating_duration_since(self.waiting_since) >= promotion_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_promotion() {
        assert!(SavePriority::Critical > SavePriority::High);
        assert!(SavePriority::High > SavePriority::Normal);
        assert!(SavePriority::Normal > SavePriority::Low);
        assert_eq!(SavePriority::Low.promoted(), SavePriority::Normal);
        assert_eq!(SavePriority::Critical.promoted(), SavePriority::Critical);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_and_critical_bypass() {
        let idle = Duration::from_secs(2);
        let now = Instant::now();
        let normal = AutoSaveEntry::new(StorageItem::new("a", ""), SavePriority::Normal, 0, now);
        let critical = AutoSaveEntry::new(StorageItem::new("b", ""), SavePriority::Critical, 1, now);

        assert!(!normal.is_eligible(now, idle, false));
        assert!(normal.is_eligible(now, idle, true));
        assert!(critical.is_eligible(now, idle, false));
        assert!(normal.is_eligible(now + idle, idle, false));
    }

    #[tokio::test(start_paused = true)]
    async fn test_supersede_keeps_highest_priority() {
        let now = Instant::now();
        let item = StorageItem::new("a", "v1");
        let mut entry = AutoSaveEntry::new(item.clone(), SavePriority::High, 0, now);

        let mut edited = item;
        edited.set_content("v2");
        entry.supersede(edited, SavePriority::Low, now + Duration::from_secs(1));

        assert_eq!(entry.item.content, "v2");
        assert_eq!(entry.priority, SavePriority::High);
        assert!(!entry.is_eligible(now + Duration::from_secs(2), Duration::from_secs(2), false));
    }
}
