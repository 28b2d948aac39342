//! Metrics for observability
//!
//! Thin layer over the `metrics` facade. Nothing is exported unless the host
//! installs a recorder; without one every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::{Duration, Instant};

pub const SAVES: &str = "notevault.storage.saves";
pub const SAVE_FAILURES: &str = "notevault.storage.save_failures";
pub const SAVE_DURATION: &str = "notevault.storage.save.duration_ms";
pub const LOADS: &str = "notevault.storage.loads";
pub const DELETES: &str = "notevault.storage.deletes";
pub const REPLICATION_FAILURES: &str = "notevault.storage.replication_failures";
pub const BACKUPS: &str = "notevault.storage.backups";
pub const ITEMS: &str = "notevault.storage.items";
pub const BYTES: &str = "notevault.storage.bytes";

pub const SYNC_CYCLES: &str = "notevault.sync.cycles";
pub const SYNC_ERRORS: &str = "notevault.sync.errors";
pub const SYNC_COPIED: &str = "notevault.sync.items_copied";
pub const SYNC_CONFLICTS: &str = "notevault.sync.conflicts";
pub const SYNC_DURATION: &str = "notevault.sync.duration_ms";

pub const AUTOSAVE_QUEUED: &str = "notevault.autosave.queued";
pub const AUTOSAVE_SAVED: &str = "notevault.autosave.saved";
pub const AUTOSAVE_FAILED: &str = "notevault.autosave.failed";
pub const AUTOSAVE_RETRIES: &str = "notevault.autosave.retries";
pub const AUTOSAVE_DEPTH: &str = "notevault.autosave.depth";
pub const AUTOSAVE_BATCH_SIZE: &str = "notevault.autosave.batch_size";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Storage metrics
    describe_counter!(SAVES, "Items written through the storage manager");
    describe_counter!(SAVE_FAILURES, "Saves rejected or failed on the primary provider");
    describe_histogram!(SAVE_DURATION, "Save duration in milliseconds");
    describe_counter!(LOADS, "Item loads from the primary provider");
    describe_counter!(DELETES, "Item deletions");
    describe_counter!(REPLICATION_FAILURES, "Failed writes to the secondary provider");
    describe_counter!(BACKUPS, "Backups created");
    describe_gauge!(ITEMS, "Items on the primary provider");
    describe_gauge!(BYTES, "Bytes used on the primary provider");

    // Sync metrics
    describe_counter!(SYNC_CYCLES, "Completed sync cycles");
    describe_counter!(SYNC_ERRORS, "Sync cycles aborted by an error");
    describe_counter!(SYNC_COPIED, "Items copied between providers by sync");
    describe_counter!(SYNC_CONFLICTS, "Conflicts detected by sync");
    describe_histogram!(SYNC_DURATION, "Sync cycle duration in milliseconds");

    // Auto-save metrics
    describe_counter!(AUTOSAVE_QUEUED, "Entries queued for auto-save");
    describe_counter!(AUTOSAVE_SAVED, "Entries saved by the auto-save queue");
    describe_counter!(AUTOSAVE_FAILED, "Entries that exhausted their retries");
    describe_counter!(AUTOSAVE_RETRIES, "Auto-save retry attempts");
    describe_gauge!(AUTOSAVE_DEPTH, "Entries waiting in the auto-save queue");
    describe_histogram!(AUTOSAVE_BATCH_SIZE, "Entries taken per auto-save flush");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer, record the duration and return it
    pub fn stop(self) -> Duration {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        record_counter(SAVES, 1);
        record_gauge(AUTOSAVE_DEPTH, 3.0);
        record_histogram(AUTOSAVE_BATCH_SIZE, 4.0);
    }

    #[test]
    fn test_timer_returns_elapsed() {
        let timer = Timer::new(SAVE_DURATION);
        std::thread::sleep(Duration::from_millis(5));
        assert!(timer.stop() >= Duration::from_millis(5));
    }
}
