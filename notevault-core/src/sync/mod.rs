/*
    sync - Reconciliation between the primary and secondary provider

    One cycle:
        idle -> scanning -> syncing -> (resolving_conflicts)? -> completed | error -> idle

    - scanning: replay the replication backlog, then enumerate both sides
    - syncing: copy one-sided items across; items present on both sides whose
      plaintext differs become conflicts
    - resolving_conflicts: auto-resolve with the provider's rule, or surface
      them for manual resolution when `enable_sync_conflicts` is set

    Only one cycle runs at a time; a trigger arriving while a cycle is in
    progress returns immediately with a skipped report. The engine holds the
    manager's state lock for reading during the whole cycle, so configuration
    swaps never happen mid-cycle.
*/

pub mod conflict;

pub use conflict::{ConflictChoice, ConflictRecord};

use crate::error::{StorageError, StorageResult};
use crate::manager::{ManagerState, StorageEvent, StorageManager};
use crate::metrics::{self, record_counter, Timer};
use crate::model::{ItemId, StorageItem, SyncStatus};
use crate::provider::StorageProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Phase of the sync state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Scanning,
    Syncing,
    ResolvingConflicts,
    Completed,
    Error(String),
}

/// What a cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Another cycle was already running; nothing was done
    pub skipped: bool,
    /// Backlog entries replayed to the secondary
    pub replayed: usize,
    pub copied_to_primary: usize,
    pub copied_to_secondary: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
}

impl SyncReport {
    fn skipped() -> Self {
        SyncReport {
            skipped: true,
            ..SyncReport::default()
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the running gate when a cycle ends, on every path
struct CycleGate<'a>(&'a AtomicBool);

impl Drop for CycleGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Periodic reconciliation driven by the storage manager
pub struct SyncEngine {
    manager: Weak<StorageManager>,
    running: AtomicBool,
    state_tx: watch::Sender<SyncState>,
    conflicts: Mutex<BTreeMap<ItemId, ConflictRecord>>,
    backlog: Mutex<BTreeSet<ItemId>>,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl SyncEngine {
    pub(crate) fn new(manager: Weak<StorageManager>) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        SyncEngine {
            manager,
            running: AtomicBool::new(false),
            state_tx,
            conflicts: Mutex::new(BTreeMap::new()),
            backlog: Mutex::new(BTreeSet::new()),
            last_sync: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_sync)
    }

    /// Error of the latest cycle, `None` once a cycle succeeds
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        lock(&self.conflicts).values().cloned().collect()
    }

    pub fn pending_conflict_count(&self) -> usize {
        lock(&self.conflicts).len()
    }

    /// Items whose secondary write failed and await replay
    pub fn backlog(&self) -> Vec<ItemId> {
        lock(&self.backlog).iter().copied().collect()
    }

    pub(crate) fn record_replication_failure(&self, id: ItemId) {
        lock(&self.backlog).insert(id);
    }

    pub(crate) fn clear_replication_failure(&self, id: &ItemId) {
        lock(&self.backlog).remove(id);
    }

    pub(crate) fn take_conflict(&self, id: &ItemId) -> Option<ConflictRecord> {
        lock(&self.conflicts).remove(id)
    }

    pub(crate) fn restore_conflict(&self, record: ConflictRecord) {
        lock(&self.conflicts).insert(record.id(), record);
    }

    pub(crate) fn forget_conflict(&self, id: &ItemId) {
        lock(&self.conflicts).remove(id);
    }

    pub(crate) fn forget_all_conflicts(&self) {
        lock(&self.conflicts).clear();
    }

    fn set_state(&self, manager: &StorageManager, state: SyncState) {
        self.state_tx.send_replace(state.clone());
        manager.emit(StorageEvent::SyncStateChanged(state));
    }

    /// Run one cycle now; coalesced into a no-op if one is already running
    pub async fn sync_now(&self) -> StorageResult<SyncReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Sync cycle already running, coalescing trigger");
            return Ok(SyncReport::skipped());
        }
        let _gate = CycleGate(&self.running);

        let manager = self
            .manager
            .upgrade()
            .ok_or_else(|| StorageError::Internal("storage manager dropped".to_string()))?;

        let timer = Timer::new(metrics::SYNC_DURATION);
        let state = manager.read_state().await;
        let outcome = self.run_cycle(&manager, &state).await;

        match &outcome {
            Ok(report) => {
                *lock(&self.last_sync) = Some(Utc::now());
                *lock(&self.last_error) = None;
                record_counter(metrics::SYNC_CYCLES, 1);
                self.set_state(&manager, SyncState::Completed);
                info!(
                    replayed = report.replayed,
                    to_primary = report.copied_to_primary,
                    to_secondary = report.copied_to_secondary,
                    conflicts = report.conflicts_detected,
                    resolved = report.conflicts_resolved,
                    "Sync cycle completed"
                );
            }
            Err(e) => {
                *lock(&self.last_error) = Some(e.to_string());
                record_counter(metrics::SYNC_ERRORS, 1);
                self.set_state(&manager, SyncState::Error(e.to_string()));
                warn!(error = %e, "Sync cycle aborted");
            }
        }
        timer.stop();

        manager.refresh_statistics_locked(&state).await;
        drop(state);
        self.set_state(&manager, SyncState::Idle);
        outcome
    }

    async fn run_cycle(&self, manager: &StorageManager, state: &ManagerState) -> StorageResult<SyncReport> {
        let mut report = SyncReport::default();

        let Some(secondary) = state.secondary.clone() else {
            debug!("No secondary provider configured, nothing to reconcile");
            return Ok(report);
        };
        let primary = state.primary.clone();

        self.set_state(manager, SyncState::Scanning);
        report.replayed = self
            .replay_backlog(manager, state, primary.as_ref(), secondary.as_ref())
            .await?;

        let local = index_by_id(primary.load_all().await?);
        let remote = index_by_id(secondary.load_all().await?);
        debug!(local = local.len(), remote = remote.len(), "Scanned providers");

        self.set_state(manager, SyncState::Syncing);
        for (id, raw) in &local {
            if !remote.contains_key(id) {
                manager
                    .copy_record(state, raw, primary.as_ref(), secondary.as_ref())
                    .await?;
                report.copied_to_secondary += 1;
            }
        }

        let mut conflicts = Vec::new();
        let mut settled = Vec::new();
        for (id, raw) in &remote {
            match local.get(id) {
                None => {
                    manager
                        .copy_record(state, raw, secondary.as_ref(), primary.as_ref())
                        .await?;
                    report.copied_to_primary += 1;
                }
                Some(local_raw) => {
                    let local_item = manager.open_record(local_raw, primary.id())?;
                    let remote_item = manager.open_record(raw, secondary.id())?;
                    if !local_item.same_content(&remote_item) {
                        conflicts.push((local_raw, ConflictRecord::new(local_item, remote_item)));
                    } else if local_raw.sync_status.is_conflict() {
                        settled.push(local_raw);
                    }
                }
            }
        }
        record_counter(
            metrics::SYNC_COPIED,
            (report.copied_to_primary + report.copied_to_secondary) as u64,
        );

        // Conflicts that no longer diverge were settled elsewhere
        let still_conflicting: BTreeSet<ItemId> =
            conflicts.iter().map(|(_, record)| record.id()).collect();
        lock(&self.conflicts).retain(|id, _| still_conflicting.contains(id));
        for raw in settled {
            let mut cleared = raw.clone();
            cleared.sync_status = SyncStatus::Synced;
            primary.save(&cleared).await?;
            debug!(item = %cleared.id(), "Conflict settled on both sides");
        }

        if conflicts.is_empty() {
            return Ok(report);
        }

        self.set_state(manager, SyncState::ResolvingConflicts);
        report.conflicts_detected = conflicts.len();
        record_counter(metrics::SYNC_CONFLICTS, conflicts.len() as u64);

        for (local_raw, record) in conflicts {
            if state.config.enable_sync_conflicts {
                self.surface_conflict(manager, primary.as_ref(), local_raw, record)
                    .await?;
            } else {
                let winner = primary.resolve_conflict(&record.local, &record.remote);
                let id = winner.id();
                manager.save_locked(state, winner).await?;
                report.conflicts_resolved += 1;
                manager.emit(StorageEvent::ConflictResolved {
                    id,
                    choice: ConflictChoice::LastWriteWins,
                });
                debug!(item = %id, "Conflict auto-resolved");
            }
        }

        Ok(report)
    }

    /// Push backlog items (or their deletion) to the secondary
    async fn replay_backlog(
        &self,
        manager: &StorageManager,
        state: &ManagerState,
        primary: &dyn StorageProvider,
        secondary: &dyn StorageProvider,
    ) -> StorageResult<usize> {
        let pending = self.backlog();
        for id in &pending {
            match primary.load(id).await? {
                Some(raw) => manager.copy_record(state, &raw, primary, secondary).await?,
                None => {
                    secondary.delete(id).await?;
                }
            }
            self.clear_replication_failure(id);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "Replayed replication backlog");
        }
        Ok(pending.len())
    }

    /// Mark the primary copy as conflicting and keep both versions for the user
    async fn surface_conflict(
        &self,
        manager: &StorageManager,
        primary: &dyn StorageProvider,
        local_raw: &StorageItem,
        record: ConflictRecord,
    ) -> StorageResult<()> {
        let id = record.id();
        if !local_raw.sync_status.is_conflict() {
            let mut marked = local_raw.clone();
            marked.sync_status = SyncStatus::Conflict;
            primary.save(&marked).await?;
        }

        let newly_detected = lock(&self.conflicts).insert(id, record).is_none();
        if newly_detected {
            info!(item = %id, "Sync conflict detected");
            manager.emit(StorageEvent::ConflictDetected { id });
        }
        Ok(())
    }
}

fn index_by_id(items: Vec<StorageItem>) -> HashMap<ItemId, StorageItem> {
    items.into_iter().map(|item| (item.id(), item)).collect()
}

/// Background loop running a cycle every `sync_interval`
///
/// The timer restarts whenever the configuration changes. Scheduled cycles
/// are skipped while the connectivity signal reports offline.
pub(crate) async fn run_timer(
    manager: Weak<StorageManager>,
    mut config_rx: watch::Receiver<Arc<crate::config::StorageConfiguration>>,
) {
    loop {
        let interval = config_rx.borrow_and_update().sync_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(strong) = manager.upgrade() else { break };
                if !strong.is_online() {
                    debug!("Offline, skipping scheduled sync");
                    continue;
                }
                if let Err(e) = strong.sync_now().await {
                    debug!(error = %e, "Scheduled sync failed, retrying next tick");
                }
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                debug!("Configuration changed, restarting sync timer");
            }
        }
    }
}
