//! Operation counters feeding the statistics snapshot

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Auto-save outcome counts and save latency at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSaveSnapshot {
    pub queued: usize,
    pub saved: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retries: u64,
    pub average_save_latency: Option<Duration>,
}

/// Lock-free counters shared by the manager and the auto-save queue
#[derive(Debug, Default)]
pub struct Counters {
    queued: AtomicUsize,
    saved: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    save_latency_micros: AtomicU64,
    save_samples: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_queued(&self, depth: usize) {
        self.queued.store(depth, Ordering::Relaxed);
    }

    pub fn inc_saved(&self) {
        self.saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the wall time of one primary save
    pub fn record_save_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.save_latency_micros.fetch_add(micros, Ordering::Relaxed);
        self.save_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AutoSaveSnapshot {
        let samples = self.save_samples.load(Ordering::Relaxed);
        let average_save_latency = (samples > 0).then(|| {
            Duration::from_micros(self.save_latency_micros.load(Ordering::Relaxed) / samples)
        });

        AutoSaveSnapshot {
            queued: self.queued.load(Ordering::Relaxed),
            saved: self.saved.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_save_latency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let counters = Counters::new();
        counters.inc_saved();
        counters.inc_saved();
        counters.inc_failed();
        counters.inc_retries();
        counters.set_queued(4);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.saved, 2);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.queued, 4);
        assert_eq!(snapshot.average_save_latency, None);
    }

    #[test]
    fn test_average_latency() {
        let counters = Counters::new();
        counters.record_save_latency(Duration::from_millis(10));
        counters.record_save_latency(Duration::from_millis(30));

        assert_eq!(
            counters.snapshot().average_save_latency,
            Some(Duration::from_millis(20))
        );
    }
}
