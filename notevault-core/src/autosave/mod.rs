/*
    autosave - Priority-ordered, debounced background flushing of dirty items

    Editors call `queue_for_save` on every change; the call never awaits. A
    background loop takes a batch of eligible entries every `flush_interval`
    and saves them through the storage manager with at most `worker_count`
    concurrent saves.

    Ordering key: (Reverse(priority), seq). `seq` is assigned on first enqueue
    and survives coalescing and retries, so an entry keeps its place in its
    tier. Each save task records its own outcome, so an interrupted flush
    never leaves an entry stuck in `saving`.

    The same id is never saved twice at once: newer content queued while a
    save is in flight waits until that save has finished.
*/

pub mod entry;

pub use entry::{AutoSaveEntry, EntryStatus, SavePriority};

use crate::config::AutoSaveConfig;
use crate::error::{StorageError, StorageResult};
use crate::manager::{StorageEvent, StorageManager};
use crate::metrics::{self, record_counter, record_gauge, record_histogram};
use crate::model::{ItemId, StorageItem};
use crate::shutdown::ShutdownCoordinator;
use crate::stats::Counters;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type OrderKey = (Reverse<SavePriority>, u64);

/// Bound on waiting for the flush loop to stop
const LOOP_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Result of `cancel_save`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The queued entry was dropped
    Cancelled,
    /// A save is in flight and will complete
    AlreadySaving,
    NotQueued,
}

/// What one flush pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub saved: usize,
    pub retried: usize,
    pub failed: usize,
}

impl FlushReport {
    pub fn attempted(&self) -> usize {
        self.saved + self.retried + self.failed
    }

    fn absorb(&mut self, other: FlushReport) {
        self.saved += other.saved;
        self.retried += other.retried;
        self.failed += other.failed;
    }
}

enum SaveOutcome {
    Saved,
    Retried,
    Failed,
}

#[derive(Default)]
struct QueueState {
    order: BTreeMap<OrderKey, ItemId>,
    entries: HashMap<ItemId, AutoSaveEntry>,
    in_flight: HashSet<ItemId>,
    history: VecDeque<(ItemId, EntryStatus)>,
    next_seq: u64,
}

impl QueueState {
    fn key(entry: &AutoSaveEntry) -> OrderKey {
        (Reverse(entry.priority), entry.seq)
    }

    fn insert(&mut self, entry: AutoSaveEntry) {
        self.order.insert(Self::key(&entry), entry.id());
        self.entries.insert(entry.id(), entry);
    }

    fn remove(&mut self, id: &ItemId) -> Option<AutoSaveEntry> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&Self::key(&entry));
        Some(entry)
    }

    fn record(&mut self, id: ItemId, status: EntryStatus, capacity: usize) {
        if capacity == 0 {
            return;
        }
        while self.history.len() >= capacity {
            self.history.pop_front();
        }
        self.history.push_back((id, status));
    }

    /// Move starving entries one tier up
    fn promote(&mut self, now: Instant, promotion_after: Duration) {
        let starving: Vec<ItemId> = self
            .entries
            .values()
            .filter(|entry| entry.is_starving(now, promotion_after))
            .map(AutoSaveEntry::id)
            .collect();

        for id in starving {
            if let Some(mut entry) = self.remove(&id) {
                entry.priority = entry.priority.promoted();
                entry.waiting_since = now;
                debug!(item = %id, priority = %entry.priority, "Promoted starving auto-save entry");
                self.insert(entry);
            }
        }
    }

    /// Take up to `max_items_per_batch` eligible entries in queue order
    fn take_batch(&mut self, now: Instant, config: &AutoSaveConfig, force: bool) -> Vec<AutoSaveEntry> {
        let ids: Vec<ItemId> = self
            .order
            .values()
            .filter(|id| !self.in_flight.contains(*id))
            .filter(|id| {
                self.entries
                    .get(*id)
                    .map(|entry| entry.is_eligible(now, config.idle_threshold, force))
                    .unwrap_or(false)
            })
            .take(config.max_items_per_batch)
            .copied()
            .collect();

        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(mut entry) = self.remove(&id) {
                entry.status = EntryStatus::Saving;
                self.in_flight.insert(id);
                batch.push(entry);
            }
        }
        batch
    }
}

struct Shared {
    manager: Weak<StorageManager>,
    config: AutoSaveConfig,
    counters: Arc<Counters>,
    state: Mutex<QueueState>,
    paused: AtomicBool,
    settled: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_depth(&self, state: &QueueState) {
        self.counters.set_queued(state.entries.len());
        record_gauge(metrics::AUTOSAVE_DEPTH, state.entries.len() as f64);
    }

    fn emit(&self, event: StorageEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.emit(event);
        }
    }

    async fn save(&self, item: &StorageItem) -> StorageResult<StorageItem> {
        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| StorageError::Internal("storage manager dropped".to_string()))?;
        manager.save_item(item).await
    }

    /// Record the result of one save and release the id
    fn complete(&self, mut entry: AutoSaveEntry, result: StorageResult<StorageItem>) -> SaveOutcome {
        let id = entry.id();
        let mut state = self.lock();
        state.in_flight.remove(&id);

        let outcome = match result {
            Ok(_) => {
                self.counters.inc_saved();
                record_counter(metrics::AUTOSAVE_SAVED, 1);
                state.record(id, EntryStatus::Saved, self.config.history_capacity);
                SaveOutcome::Saved
            }
            Err(e) if state.entries.contains_key(&id) => {
                // Newer content is already queued and will be saved instead
                debug!(item = %id, error = %e, "Auto-save failed, superseded by a newer edit");
                SaveOutcome::Retried
            }
            Err(e) => {
                entry.retries += 1;
                entry.last_error = Some(e.to_string());

                if entry.retries > self.config.max_retries {
                    warn!(item = %id, retries = entry.retries, error = %e, "Auto-save failed permanently");
                    self.counters.inc_failed();
                    record_counter(metrics::AUTOSAVE_FAILED, 1);
                    state.record(id, EntryStatus::Failed, self.config.history_capacity);
                    self.emit(StorageEvent::AutoSaveFailed {
                        id,
                        error: e.to_string(),
                    });
                    SaveOutcome::Failed
                } else {
                    let delay = self.config.backoff_for(entry.retries);
                    debug!(item = %id, retries = entry.retries, ?delay, error = %e, "Auto-save failed, retrying");
                    self.counters.inc_retries();
                    record_counter(metrics::AUTOSAVE_RETRIES, 1);
                    entry.status = EntryStatus::Queued;
                    entry.next_attempt = Instant::now() + delay;
                    state.insert(entry);
                    SaveOutcome::Retried
                }
            }
        };

        self.publish_depth(&state);
        drop(state);
        self.settled.notify_waiters();
        outcome
    }

    /// Save one batch, waiting for every save in it
    async fn run_batch(self: &Arc<Self>, batch: Vec<AutoSaveEntry>) -> FlushReport {
        let mut report = FlushReport::default();
        if batch.is_empty() {
            return report;
        }
        debug!(size = batch.len(), "Flushing auto-save batch");
        record_histogram(metrics::AUTOSAVE_BATCH_SIZE, batch.len() as f64);

        let workers = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let mut handles = Vec::with_capacity(batch.len());
        for entry in batch {
            // Permits are taken in queue order so saves start in queue order
            let Ok(permit) = workers.clone().acquire_owned().await else {
                break;
            };
            let shared = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let result = shared.save(&entry.item).await;
                drop(permit);
                shared.complete(entry, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(SaveOutcome::Saved) => report.saved += 1,
                Ok(SaveOutcome::Retried) => report.retried += 1,
                Ok(SaveOutcome::Failed) => report.failed += 1,
                Err(e) => warn!(error = %e, "Auto-save task panicked"),
            }
        }
        report
    }

    async fn flush(self: &Arc<Self>, force: bool) -> FlushReport {
        let batch = {
            let mut state = self.lock();
            let now = Instant::now();
            state.promote(now, self.config.promotion_after);
            let batch = state.take_batch(now, &self.config, force);
            self.publish_depth(&state);
            batch
        };
        self.run_batch(batch).await
    }
}

/// Debounced, prioritized auto-save in front of `StorageManager::save_item`
pub struct AutoSaveQueue {
    shared: Arc<Shared>,
    shutdown: ShutdownCoordinator,
}

impl AutoSaveQueue {
    pub fn new(manager: &Arc<StorageManager>, config: AutoSaveConfig) -> Self {
        AutoSaveQueue {
            shared: Arc::new(Shared {
                manager: Arc::downgrade(manager),
                counters: manager.counters(),
                config,
                state: Mutex::new(QueueState::default()),
                paused: AtomicBool::new(false),
                settled: Notify::new(),
            }),
            shutdown: ShutdownCoordinator::new(LOOP_STOP_TIMEOUT),
        }
    }

    pub fn config(&self) -> &AutoSaveConfig {
        &self.shared.config
    }

    /// Mark an item dirty
    ///
    /// A pending entry for the same id takes the new content and keeps its
    /// place; its priority becomes the higher of the two.
    pub fn queue_for_save(&self, item: StorageItem, priority: SavePriority) {
        let now = Instant::now();
        let id = item.id();
        let mut state = self.shared.lock();

        match state.remove(&id) {
            Some(mut pending) => {
                pending.supersede(item, priority, now);
                state.insert(pending);
            }
            None => {
                let seq = state.next_seq;
                state.next_seq += 1;
                state.insert(AutoSaveEntry::new(item, priority, seq, now));
                record_counter(metrics::AUTOSAVE_QUEUED, 1);
            }
        }
        self.shared.publish_depth(&state);
    }

    /// Drop a queued entry; an entry already saving completes
    pub fn cancel_save(&self, id: &ItemId) -> CancelOutcome {
        let mut state = self.shared.lock();
        if state.remove(id).is_some() {
            state.record(*id, EntryStatus::Cancelled, self.shared.config.history_capacity);
            self.shared.counters.inc_cancelled();
            self.shared.publish_depth(&state);
            debug!(item = %id, "Auto-save cancelled");
            CancelOutcome::Cancelled
        } else if state.in_flight.contains(id) {
            CancelOutcome::AlreadySaving
        } else {
            CancelOutcome::NotQueued
        }
    }

    /// Latest known status of an id
    ///
    /// Queued content wins over an in-flight save of older content.
    pub fn status(&self, id: &ItemId) -> Option<EntryStatus> {
        let state = self.shared.lock();
        if state.entries.contains_key(id) {
            return Some(EntryStatus::Queued);
        }
        if state.in_flight.contains(id) {
            return Some(EntryStatus::Saving);
        }
        state
            .history
            .iter()
            .rev()
            .find(|(entry_id, _)| entry_id == id)
            .map(|(_, status)| *status)
    }

    /// Snapshot of a pending entry
    pub fn entry(&self, id: &ItemId) -> Option<AutoSaveEntry> {
        self.shared.lock().entries.get(id).cloned()
    }

    /// Queued ids in drain order
    pub fn pending_order(&self) -> Vec<ItemId> {
        self.shared.lock().order.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    /// Stop draining; queued entries are kept
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        info!("Auto-save paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        info!("Auto-save resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Flush one batch of eligible entries; a no-op while paused
    pub async fn flush_once(&self) -> FlushReport {
        if self.is_paused() {
            return FlushReport::default();
        }
        self.shared.flush(false).await
    }

    /// Drain every queued entry, ignoring debounce and backoff
    ///
    /// Returns once nothing is queued or in flight. Failing entries are
    /// retried until they exhaust their retries.
    pub async fn flush_now(&self) -> FlushReport {
        let mut total = FlushReport::default();
        loop {
            let report = self.shared.flush(true).await;
            total.absorb(report);
            if report.attempted() > 0 {
                continue;
            }

            let settled = self.shared.settled.notified();
            {
                let state = self.shared.lock();
                if state.entries.is_empty() && state.in_flight.is_empty() {
                    break;
                }
            }
            // Another flush owns the remaining in-flight saves
            let _ = tokio::time::timeout(self.shared.config.flush_interval, settled).await;
        }
        total
    }

    /// Start the background flush loop
    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let started = self.shutdown.spawn("autosave", async move {
            let mut ticker = tokio::time::interval(shared.config.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shared.manager.strong_count() == 0 {
                    break;
                }
                if !shared.paused.load(Ordering::SeqCst) {
                    shared.flush(false).await;
                }
            }
        });
        if started {
            info!(
                interval = ?self.shared.config.flush_interval,
                workers = self.shared.config.worker_count,
                "Auto-save started"
            );
        }
    }

    /// Stop the loop, then flush everything still pending
    pub async fn stop(&self) -> FlushReport {
        self.shutdown.shutdown().await;
        let report = self.flush_now().await;
        info!(saved = report.saved, failed = report.failed, "Auto-save stopped");
        report
    }
}
