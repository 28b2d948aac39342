//! Storage manager - the façade editors talk to
//!
//! Owns the active configuration and the provider registry, routes item
//! operations to the primary and secondary provider, applies encryption,
//! drives the sync engine and publishes statistics and events.
//!
//! # Locking
//!
//! State lives behind a `tokio::sync::RwLock`. Item operations and sync
//! cycles take the read side; `update_configuration`, `register_provider`
//! and `restore_backup` take the write side. Internal `*_locked` helpers
//! receive the guard so a cycle never re-acquires the lock.
//!
//! With a quota configured, the quota check and the primary write of a save
//! run under `quota_gate`, so concurrent saves cannot both claim the same
//! free space.

mod events;
mod registry;

pub use events::{StorageEvent, EVENT_CHANNEL_CAPACITY};
pub use registry::ProviderRegistry;

use crate::config::StorageConfiguration;
use crate::crypto::{CredentialStore, EncryptionService, KdfParams, MemoryCredentialStore};
use crate::error::{StorageError, StorageResult};
use crate::health::{self, HealthCheck};
use crate::metrics::{self, record_counter, record_gauge, Timer};
use crate::model::{ItemId, ProviderId, StorageItem, SyncStatus};
use crate::provider::{archive, StorageProvider};
use crate::shutdown::ShutdownCoordinator;
use crate::stats::{self, Counters, StatisticsInput, StorageStatistics};
use crate::sync::{self, ConflictChoice, ConflictRecord, SyncEngine, SyncReport, SyncState};
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};

/// Default bound on how long shutdown waits for background loops
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration plus the providers it resolved to
pub(crate) struct ManagerState {
    pub(crate) config: Arc<StorageConfiguration>,
    pub(crate) registry: ProviderRegistry,
    pub(crate) primary: Arc<dyn StorageProvider>,
    pub(crate) secondary: Option<Arc<dyn StorageProvider>>,
}

impl ManagerState {
    fn resolve(config: StorageConfiguration, registry: ProviderRegistry) -> StorageResult<Self> {
        config.validate()?;
        let primary = registry.get(&config.primary_provider)?;
        let secondary = config
            .secondary_provider
            .as_ref()
            .map(|id| registry.get(id))
            .transpose()?;

        let options = config.provider_options();
        primary.configure(&options);
        if let Some(secondary) = &secondary {
            secondary.configure(&options);
        }

        Ok(ManagerState {
            config: Arc::new(config),
            registry,
            primary,
            secondary,
        })
    }

    fn active(&self) -> Vec<Arc<dyn StorageProvider>> {
        let mut active = vec![self.primary.clone()];
        active.extend(self.secondary.clone());
        active
    }
}

/// Marks the manager busy for the lifetime of an operation
struct BusyGuard<'a>(&'a AtomicUsize);

impl<'a> BusyGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        BusyGuard(counter)
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Builder for `StorageManager`
pub struct StorageManagerBuilder {
    config: StorageConfiguration,
    registry: ProviderRegistry,
    credentials: Option<Arc<dyn CredentialStore>>,
    kdf: KdfParams,
    connectivity: Option<watch::Receiver<bool>>,
    shutdown_timeout: Duration,
}

impl StorageManagerBuilder {
    pub fn provider(mut self, provider: impl StorageProvider + 'static) -> Self {
        self.registry.register(Arc::new(provider));
        self
    }

    /// Register a provider the caller keeps a handle to
    pub fn shared_provider(mut self, provider: Arc<dyn StorageProvider>) -> Self {
        self.registry.register(provider);
        self
    }

    pub fn credentials(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credentials = Some(store);
        self
    }

    pub fn kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }

    /// Connectivity signal; `false` suspends scheduled sync cycles
    pub fn connectivity(mut self, online: watch::Receiver<bool>) -> Self {
        self.connectivity = Some(online);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Resolve the configured providers and compute initial statistics
    ///
    /// Background loops are not started; call `StorageManager::start`.
    pub async fn build(self) -> StorageResult<Arc<StorageManager>> {
        let state = ManagerState::resolve(self.config, self.registry)?;
        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(MemoryCredentialStore::new()));

        let (config_tx, _) = watch::channel(state.config.clone());
        let (stats_tx, _) = watch::channel(StorageStatistics::default());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            primary = %state.config.primary_provider,
            secondary = ?state.config.secondary_provider.as_ref().map(ProviderId::as_str),
            encryption = state.config.encryption_enabled,
            "Storage manager initialized"
        );

        let manager = Arc::new_cyclic(|weak| StorageManager {
            state: RwLock::new(state),
            config_tx,
            encryption: EncryptionService::new(credentials, self.kdf),
            sync: SyncEngine::new(weak.clone()),
            counters: Arc::new(Counters::new()),
            stats_tx,
            events,
            busy: AtomicUsize::new(0),
            connectivity: self.connectivity,
            last_backup: Mutex::new(None),
            quota_gate: AsyncMutex::new(()),
            shutdown: ShutdownCoordinator::new(self.shutdown_timeout),
        });

        manager.refresh_statistics().await;
        Ok(manager)
    }
}

/// Routes item operations across providers
pub struct StorageManager {
    state: RwLock<ManagerState>,
    config_tx: watch::Sender<Arc<StorageConfiguration>>,
    encryption: EncryptionService,
    sync: SyncEngine,
    counters: Arc<Counters>,
    stats_tx: watch::Sender<StorageStatistics>,
    events: broadcast::Sender<StorageEvent>,
    busy: AtomicUsize,
    connectivity: Option<watch::Receiver<bool>>,
    last_backup: Mutex<Option<DateTime<Utc>>>,
    quota_gate: AsyncMutex<()>,
    shutdown: ShutdownCoordinator,
}

impl StorageManager {
    pub fn builder(config: StorageConfiguration) -> StorageManagerBuilder {
        StorageManagerBuilder {
            config,
            registry: ProviderRegistry::new(),
            credentials: None,
            kdf: KdfParams::default(),
            connectivity: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Spawn the sync timer and the maintenance loop (statistics, auto-backup)
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.shutdown
            .spawn("sync-timer", sync::run_timer(weak.clone(), self.config_tx.subscribe()));
        self.shutdown
            .spawn("maintenance", maintenance_loop(weak, self.config_tx.subscribe()));
    }

    /// Stop background loops
    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
    }

    pub(crate) async fn read_state(&self) -> RwLockReadGuard<'_, ManagerState> {
        self.state.read().await
    }

    pub(crate) fn emit(&self, event: StorageEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn counters(&self) -> Arc<Counters> {
        self.counters.clone()
    }

    /// Current configuration snapshot
    pub fn configuration(&self) -> Arc<StorageConfiguration> {
        self.config_tx.borrow().clone()
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_statistics(&self) -> watch::Receiver<StorageStatistics> {
        self.stats_tx.subscribe()
    }

    pub fn subscribe_sync_state(&self) -> watch::Receiver<SyncState> {
        self.sync.subscribe()
    }

    pub fn statistics(&self) -> StorageStatistics {
        self.stats_tx.borrow().clone()
    }

    pub fn health(&self) -> HealthCheck {
        health::assess(&self.statistics())
    }

    /// True while any item operation is in flight
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst) > 0
    }

    pub fn is_online(&self) -> bool {
        self.connectivity
            .as_ref()
            .map(|online| *online.borrow())
            .unwrap_or(true)
    }

    pub fn store_password(&self, provider: &ProviderId, password: SecretString) -> StorageResult<()> {
        self.encryption.store_password(provider, password)
    }

    pub fn get_password(&self, provider: &ProviderId) -> StorageResult<Option<SecretString>> {
        self.encryption.get_password(provider)
    }

    // -- item operations --------------------------------------------------

    /// Persist an item on the primary and replicate it to the secondary
    ///
    /// Returns the plaintext item as stored (owning provider and sync status
    /// updated). A failed secondary write is logged, queued for the next sync
    /// and does not fail the call.
    pub async fn save_item(&self, item: &StorageItem) -> StorageResult<StorageItem> {
        let _busy = BusyGuard::enter(&self.busy);
        let timer = Timer::new(metrics::SAVE_DURATION);

        let state = self.state.read().await;
        let result = self.save_locked(&state, item.clone()).await;
        self.counters.record_save_latency(timer.stop());

        match &result {
            Ok(saved) => {
                record_counter(metrics::SAVES, 1);
                self.emit(StorageEvent::ItemSaved {
                    id: saved.id(),
                    provider: state.config.primary_provider.clone(),
                });
            }
            Err(e) => {
                record_counter(metrics::SAVE_FAILURES, 1);
                debug!(item = %item.id(), error = %e, "Save failed");
            }
        }

        self.refresh_statistics_locked(&state).await;
        result
    }

    pub(crate) async fn save_locked(&self, state: &ManagerState, item: StorageItem) -> StorageResult<StorageItem> {
        let config = &state.config;
        let mut record = item;
        record.validate()?;
        record.provider = config.primary_provider.clone();
        record.sync_status = SyncStatus::Synced;

        let primary_record = self.seal_for(config, &record, state.primary.id())?;
        let quota_guard = match config.storage_quota {
            Some(_) => Some(self.quota_gate.lock().await),
            None => None,
        };
        self.check_quota(state, &primary_record).await?;
        state.primary.save(&primary_record).await?;
        drop(quota_guard);

        if let Some(secondary) = &state.secondary {
            let replicated = match self.seal_for(config, &record, secondary.id()) {
                Ok(secondary_record) => secondary.save(&secondary_record).await,
                Err(e) => Err(e),
            };

            match replicated {
                Ok(()) => self.sync.clear_replication_failure(&record.id()),
                Err(e) => {
                    warn!(
                        item = %record.id(),
                        provider = %secondary.id(),
                        error = %e,
                        "Replication to secondary failed, queued for next sync"
                    );
                    record_counter(metrics::REPLICATION_FAILURES, 1);
                    self.sync.record_replication_failure(record.id());
                    self.emit(StorageEvent::ReplicationFailed {
                        id: record.id(),
                        provider: secondary.id().clone(),
                        error: e.to_string(),
                    });

                    let mut pending = primary_record;
                    pending.sync_status = SyncStatus::Pending;
                    if let Err(e) = state.primary.save(&pending).await {
                        warn!(item = %record.id(), error = %e, "Failed to mark item pending");
                    }
                    record.sync_status = SyncStatus::Pending;
                }
            }
        }

        Ok(record)
    }

    /// Encrypt for `target` when encryption is enabled
    fn seal_for(
        &self,
        config: &StorageConfiguration,
        item: &StorageItem,
        target: &ProviderId,
    ) -> StorageResult<StorageItem> {
        if config.encryption_enabled {
            self.encryption.encrypt_item(item, target)
        } else {
            Ok(item.clone())
        }
    }

    /// Plaintext view of a record read from `source`
    pub(crate) fn open_record(&self, raw: &StorageItem, source: &ProviderId) -> StorageResult<StorageItem> {
        self.encryption.decrypt_item(raw, source)
    }

    /// Copy a raw record between providers, re-keying it for the destination
    ///
    /// The primary's record is `Uploading` or `Downloading` while the
    /// transfer runs and `Synced` once it lands. A failed upload leaves it
    /// in `Error`.
    pub(crate) async fn copy_record(
        &self,
        state: &ManagerState,
        raw: &StorageItem,
        from: &dyn StorageProvider,
        to: &dyn StorageProvider,
    ) -> StorageResult<()> {
        let plain = self.open_record(raw, from.id())?;
        let mut copy = self.seal_for(&state.config, &plain, to.id())?;
        copy.provider = state.config.primary_provider.clone();

        if from.id() == state.primary.id() {
            let mut source = raw.clone();
            source.sync_status = SyncStatus::Uploading;
            from.save(&source).await?;

            copy.sync_status = SyncStatus::Synced;
            if let Err(e) = to.save(&copy).await {
                source.sync_status = SyncStatus::Error(e.to_string());
                if let Err(mark) = from.save(&source).await {
                    warn!(item = %source.id(), error = %mark, "Failed to mark upload error");
                }
                return Err(e);
            }

            source.sync_status = SyncStatus::Synced;
            from.save(&source).await?;
        } else {
            copy.sync_status = SyncStatus::Downloading;
            to.save(&copy).await?;
            copy.sync_status = SyncStatus::Synced;
            to.save(&copy).await?;

            if raw.sync_status != SyncStatus::Synced {
                let mut settled = raw.clone();
                settled.sync_status = SyncStatus::Synced;
                from.save(&settled).await?;
            }
        }
        Ok(())
    }

    /// Reject a write that would push the primary past the quota
    ///
    /// Usage is measured on the primary itself, not the published
    /// statistics, which lag behind writes. Callers hold `quota_gate`.
    async fn check_quota(&self, state: &ManagerState, record: &StorageItem) -> StorageResult<()> {
        let Some(quota) = state.config.storage_quota else {
            return Ok(());
        };

        let id = record.id();
        let used: u64 = state
            .primary
            .load_all()
            .await?
            .iter()
            .filter(|current| current.id() != id)
            .map(StorageItem::size_bytes)
            .sum();
        let available = quota.saturating_sub(used);
        let required = record.size_bytes();

        if required > available {
            return Err(StorageError::QuotaExceeded { required, available });
        }
        Ok(())
    }

    /// Read an item from the primary provider
    pub async fn load_item(&self, id: &ItemId) -> StorageResult<Option<StorageItem>> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.read().await;
        record_counter(metrics::LOADS, 1);

        state
            .primary
            .load(id)
            .await?
            .map(|raw| self.open_record(&raw, state.primary.id()))
            .transpose()
    }

    /// Every item on the primary provider, decrypted
    pub async fn load_all_items(&self) -> StorageResult<Vec<StorageItem>> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.read().await;

        state
            .primary
            .load_all()
            .await?
            .iter()
            .map(|raw| self.open_record(raw, state.primary.id()))
            .collect()
    }

    /// Delete on the primary, then the secondary; returns the primary's answer
    pub async fn delete_item(&self, id: &ItemId) -> StorageResult<bool> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.read().await;

        let existed = state.primary.delete(id).await?;
        if let Some(secondary) = &state.secondary {
            match secondary.delete(id).await {
                Ok(_) => self.sync.clear_replication_failure(id),
                Err(e) => {
                    warn!(item = %id, provider = %secondary.id(), error = %e, "Secondary delete failed, queued for next sync");
                    record_counter(metrics::REPLICATION_FAILURES, 1);
                    self.sync.record_replication_failure(*id);
                    self.emit(StorageEvent::ReplicationFailed {
                        id: *id,
                        provider: secondary.id().clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        self.sync.forget_conflict(id);

        record_counter(metrics::DELETES, 1);
        self.emit(StorageEvent::ItemDeleted { id: *id, existed });
        self.refresh_statistics_locked(&state).await;
        Ok(existed)
    }

    // -- backup and interchange ------------------------------------------

    /// Archive the primary provider
    pub async fn create_backup(&self) -> StorageResult<PathBuf> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.read().await;

        let location = state.primary.create_backup().await?;
        *self.last_backup.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        record_counter(metrics::BACKUPS, 1);
        self.emit(StorageEvent::BackupCreated {
            provider: state.primary.id().clone(),
            location: location.clone(),
        });

        self.refresh_statistics_locked(&state).await;
        Ok(location)
    }

    /// Replace the primary's contents from an archive
    ///
    /// Runs exclusively: no save or sync observes a half-restored store.
    pub async fn restore_backup(&self, location: &Path) -> StorageResult<()> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.write().await;

        state.primary.restore_backup(location).await?;
        info!(provider = %state.primary.id(), location = %location.display(), "Primary restored from backup");
        self.sync.forget_all_conflicts();
        if let Some(secondary) = state.secondary.clone() {
            self.mirror_restored(&state, secondary.as_ref()).await;
        }
        self.emit(StorageEvent::BackupRestored {
            provider: state.primary.id().clone(),
            location: location.to_path_buf(),
        });

        let state = state.downgrade();
        self.refresh_statistics_locked(&state).await;
        Ok(())
    }

    /// Make the secondary hold exactly the restored item set
    ///
    /// Records missing from the archive are deleted there and restored
    /// records are copied over, so the next sync cannot bring back what the
    /// restore removed. Writes that fail now go to the replication backlog.
    async fn mirror_restored(&self, state: &ManagerState, secondary: &dyn StorageProvider) {
        let primary = state.primary.as_ref();
        let restored = match primary.load_all().await {
            Ok(items) => items,
            Err(e) => {
                warn!(provider = %primary.id(), error = %e, "Cannot read restored items, secondary left as is");
                return;
            }
        };
        let restored_ids: BTreeSet<ItemId> = restored.iter().map(StorageItem::id).collect();

        let stale: Vec<ItemId> = match secondary.load_all().await {
            Ok(items) => items
                .iter()
                .map(StorageItem::id)
                .filter(|id| !restored_ids.contains(id))
                .collect(),
            Err(e) => {
                warn!(provider = %secondary.id(), error = %e, "Cannot list secondary after restore");
                Vec::new()
            }
        };

        for id in &stale {
            match secondary.delete(id).await {
                Ok(_) => self.sync.clear_replication_failure(id),
                Err(e) => {
                    warn!(item = %id, provider = %secondary.id(), error = %e, "Secondary delete failed, queued for next sync");
                    self.sync.record_replication_failure(*id);
                }
            }
        }

        for raw in &restored {
            match self.copy_record(state, raw, primary, secondary).await {
                Ok(()) => self.sync.clear_replication_failure(&raw.id()),
                Err(e) => {
                    warn!(item = %raw.id(), provider = %secondary.id(), error = %e, "Secondary copy failed, queued for next sync");
                    record_counter(metrics::REPLICATION_FAILURES, 1);
                    self.sync.record_replication_failure(raw.id());
                }
            }
        }

        debug!(copied = restored.len(), removed = stale.len(), "Secondary aligned with restored primary");
    }

    /// Write the primary's records as an interchange document
    ///
    /// Encrypted records are exported as ciphertext.
    pub async fn export_all(&self) -> StorageResult<PathBuf> {
        let _busy = BusyGuard::enter(&self.busy);
        let state = self.state.read().await;
        state.primary.export_all().await
    }

    /// Import an interchange document through the regular save path
    ///
    /// Records encrypted for the primary are opened first; records that
    /// cannot be opened or saved are skipped. Returns the number saved.
    pub async fn import_from(&self, location: &Path) -> StorageResult<usize> {
        let _busy = BusyGuard::enter(&self.busy);
        let bytes = tokio::fs::read(location).await?;
        let records = archive::decode_export(&bytes)?;

        let state = self.state.read().await;
        let mut imported = 0;
        for raw in records {
            let id = raw.id();
            let outcome = match self.open_record(&raw, state.primary.id()) {
                Ok(plain) => self.save_locked(&state, plain).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(_) => imported += 1,
                Err(e) => warn!(item = %id, error = %e, "Skipping record during import"),
            }
        }

        info!(imported, location = %location.display(), "Import finished");
        self.emit(StorageEvent::ItemsImported { count: imported });
        self.refresh_statistics_locked(&state).await;
        Ok(imported)
    }

    // -- configuration ----------------------------------------------------

    /// Validate and swap in a new configuration
    ///
    /// Waits for in-flight operations, re-resolves and re-configures the
    /// active providers and restarts the sync timer.
    pub async fn update_configuration(&self, config: StorageConfiguration) -> StorageResult<()> {
        config.validate()?;
        let mut state = self.state.write().await;

        let next = ManagerState::resolve(config, state.registry.clone())?;
        *state = next;
        self.config_tx.send_replace(state.config.clone());
        info!(
            primary = %state.config.primary_provider,
            sync_interval = ?state.config.sync_interval,
            "Configuration updated"
        );
        self.emit(StorageEvent::ConfigurationUpdated);

        let state = state.downgrade();
        self.refresh_statistics_locked(&state).await;
        Ok(())
    }

    /// Add (or replace) a backend in the registry
    pub async fn register_provider(&self, provider: Arc<dyn StorageProvider>) {
        let mut state = self.state.write().await;
        debug!(provider = %provider.id(), kind = %provider.kind(), "Registering provider");
        state.registry.register(provider);
    }

    pub async fn registered_providers(&self) -> Vec<ProviderId> {
        self.state.read().await.registry.ids()
    }

    // -- sync -------------------------------------------------------------

    /// Run a sync cycle now
    pub async fn sync_now(&self) -> StorageResult<SyncReport> {
        self.sync.sync_now().await
    }

    pub fn pending_conflicts(&self) -> Vec<ConflictRecord> {
        self.sync.pending_conflicts()
    }

    /// Settle a surfaced conflict; the kept version is written to both sides
    pub async fn resolve_conflict(&self, id: &ItemId, choice: ConflictChoice) -> StorageResult<StorageItem> {
        let _busy = BusyGuard::enter(&self.busy);
        let record = self
            .sync
            .take_conflict(id)
            .ok_or_else(|| StorageError::NotFound(format!("no pending conflict for item {}", id)))?;

        let state = self.state.read().await;
        if let Err(e) = self.ensure_conflict_current(&state, &record).await {
            self.sync.restore_conflict(record);
            return Err(e);
        }

        let winner = match choice {
            ConflictChoice::LastWriteWins => state.primary.resolve_conflict(&record.local, &record.remote),
            other => record.pick(other).clone(),
        };

        match self.save_locked(&state, winner).await {
            Ok(saved) => {
                info!(item = %id, ?choice, "Conflict resolved");
                self.emit(StorageEvent::ConflictResolved { id: *id, choice });
                self.refresh_statistics_locked(&state).await;
                Ok(saved)
            }
            Err(e) => {
                self.sync.restore_conflict(record);
                Err(e)
            }
        }
    }

    /// Fail with `SyncConflict` if either side changed since detection
    ///
    /// A choice made against an outdated pair would silently drop the newer
    /// edit. The next sync cycle refreshes or clears the pending record.
    async fn ensure_conflict_current(&self, state: &ManagerState, record: &ConflictRecord) -> StorageResult<()> {
        let id = record.id();
        let local = match state.primary.load(&id).await? {
            Some(raw) => self.open_record(&raw, state.primary.id())?,
            None => return Err(StorageError::NotFound(format!("item {} is no longer stored", id))),
        };
        let remote = match &state.secondary {
            Some(secondary) => match secondary.load(&id).await? {
                Some(raw) => self.open_record(&raw, secondary.id())?,
                None => record.remote.clone(),
            },
            None => record.remote.clone(),
        };

        if local.same_content(&record.local) && remote.same_content(&record.remote) {
            return Ok(());
        }
        debug!(item = %id, "Conflict changed since detection");
        Err(StorageError::SyncConflict {
            local: Box::new(local),
            remote: Box::new(remote),
        })
    }

    // -- statistics and maintenance ---------------------------------------

    /// Recompute and publish statistics
    pub async fn refresh_statistics(&self) -> StorageStatistics {
        let state = self.state.read().await;
        self.refresh_statistics_locked(&state).await
    }

    pub(crate) async fn refresh_statistics_locked(&self, state: &ManagerState) -> StorageStatistics {
        let mut scans = Vec::new();
        for provider in state.active() {
            match provider.load_all().await {
                Ok(items) => scans.push((provider.id().clone(), items)),
                Err(e) => warn!(provider = %provider.id(), error = %e, "Statistics scan failed"),
            }
        }

        let last_backup = *self.last_backup.lock().unwrap_or_else(PoisonError::into_inner);
        let statistics = stats::compute(StatisticsInput {
            primary: Some(&state.config.primary_provider),
            scans: scans
                .iter()
                .map(|(id, items)| (id, items.as_slice()))
                .collect(),
            quota: state.config.storage_quota,
            last_backup,
            last_sync: self.sync.last_sync(),
            last_sync_error: self.sync.last_error(),
            pending_conflicts: self.sync.pending_conflict_count(),
            autosave: self.counters.snapshot(),
        });

        record_gauge(metrics::ITEMS, statistics.total_items as f64);
        record_gauge(metrics::BYTES, statistics.used_bytes as f64);
        self.stats_tx.send_replace(statistics.clone());
        statistics
    }

    /// Create a backup if auto-backup is on and the interval elapsed
    pub async fn auto_backup_if_due(&self) -> StorageResult<Option<PathBuf>> {
        let config = self.configuration();
        if !config.auto_backup_enabled {
            return Ok(None);
        }

        let last = *self.last_backup.lock().unwrap_or_else(PoisonError::into_inner);
        let due = match last {
            None => true,
            Some(at) => (Utc::now() - at)
                .to_std()
                .map(|elapsed| elapsed >= config.auto_backup_interval)
                .unwrap_or(false),
        };

        if due {
            debug!("Auto-backup due");
            self.create_backup().await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// One maintenance tick: refresh statistics, then auto-backup if due
    pub async fn run_maintenance(&self) {
        self.refresh_statistics().await;
        if let Err(e) = self.auto_backup_if_due().await {
            warn!(error = %e, "Auto-backup failed");
        }
    }
}

/// Background loop ticking every `stats_refresh_interval`
async fn maintenance_loop(
    manager: std::sync::Weak<StorageManager>,
    mut config_rx: watch::Receiver<Arc<StorageConfiguration>>,
) {
    loop {
        let interval = config_rx.borrow_and_update().stats_refresh_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(strong) = manager.upgrade() else { break };
                strong.run_maintenance().await;
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use chrono::Duration as ChronoDuration;

    async fn manager_with(
        config: StorageConfiguration,
    ) -> (Arc<StorageManager>, Arc<MemoryProvider>, Arc<MemoryProvider>) {
        let primary = Arc::new(MemoryProvider::new("local"));
        let secondary = Arc::new(MemoryProvider::new("local-b"));
        let manager = StorageManager::builder(config)
            .shared_provider(primary.clone())
            .shared_provider(secondary.clone())
            .kdf_params(KdfParams::insecure_fast())
            .build()
            .await
            .unwrap();
        (manager, primary, secondary)
    }

    fn replicated() -> StorageConfiguration {
        StorageConfiguration::new("local").with_secondary("local-b")
    }

    #[tokio::test]
    async fn test_missing_provider_is_rejected() {
        let result = StorageManager::builder(StorageConfiguration::new("dropbox"))
            .provider(MemoryProvider::new("local"))
            .build()
            .await;
        assert!(matches!(result, Err(StorageError::ProviderNotAvailable(_))));
    }

    #[tokio::test]
    async fn test_save_replicates_to_secondary() {
        let (manager, primary, secondary) = manager_with(replicated()).await;
        let item = StorageItem::new("t", "c");

        let saved = manager.save_item(&item).await.unwrap();
        assert_eq!(saved.sync_status, SyncStatus::Synced);
        assert_eq!(saved.provider, ProviderId::local());
        assert!(primary.load(&item.id()).await.unwrap().is_some());
        assert!(secondary.load(&item.id()).await.unwrap().is_some());
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn test_replication_failure_does_not_fail_save() {
        let (manager, primary, secondary) = manager_with(replicated()).await;
        secondary.fail_next_saves(1);
        let item = StorageItem::new("t", "c");

        let saved = manager.save_item(&item).await.unwrap();
        assert_eq!(saved.sync_status, SyncStatus::Pending);
        assert_eq!(manager.sync_engine().backlog(), vec![item.id()]);
        assert_eq!(
            primary.load(&item.id()).await.unwrap().unwrap().sync_status,
            SyncStatus::Pending
        );

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.replayed, 1);
        assert!(manager.sync_engine().backlog().is_empty());
        assert!(secondary.load(&item.id()).await.unwrap().is_some());
        assert_eq!(
            primary.load(&item.id()).await.unwrap().unwrap().sync_status,
            SyncStatus::Synced
        );
    }

    #[tokio::test]
    async fn test_primary_failure_surfaces() {
        let (manager, primary, _) = manager_with(replicated()).await;
        primary.fail_next_saves(1);

        let result = manager.save_item(&StorageItem::new("t", "c")).await;
        assert!(matches!(result, Err(StorageError::Storage(_))));
        assert!(!manager.is_busy());
    }

    #[tokio::test]
    async fn test_encrypted_at_rest_and_readable() {
        let (manager, primary, secondary) = manager_with(replicated().with_encryption(true)).await;
        let item = StorageItem::new("t", "secret body");
        manager.save_item(&item).await.unwrap();

        let raw_primary = primary.load(&item.id()).await.unwrap().unwrap();
        let raw_secondary = secondary.load(&item.id()).await.unwrap().unwrap();
        assert!(raw_primary.is_encrypted && raw_secondary.is_encrypted);
        assert!(!raw_primary.content.contains("secret"));
        assert_ne!(raw_primary.content, raw_secondary.content);

        let loaded = manager.load_item(&item.id()).await.unwrap().unwrap();
        assert_eq!(loaded.content, "secret body");
        assert!(!loaded.is_encrypted);
    }

    #[tokio::test]
    async fn test_wrong_password_fails_closed() {
        let (manager, _, _) = manager_with(StorageConfiguration::new("local").with_encryption(true)).await;
        let item = StorageItem::new("t", "secret");
        manager.save_item(&item).await.unwrap();

        manager
            .store_password(&ProviderId::local(), SecretString::new("other".to_string()))
            .unwrap();
        let result = manager.load_item(&item.id()).await;
        assert!(matches!(result, Err(StorageError::DecryptionFailed(_))));
    }

    #[tokio::test]
    async fn test_quota_checked_before_write() {
        let (manager, primary, _) = manager_with(StorageConfiguration::new("local").with_quota(Some(20))).await;

        let small = StorageItem::new("a", "0123456789");
        manager.save_item(&small).await.unwrap();

        let big = StorageItem::new("b", "0123456789abcdef");
        let err = manager.save_item(&big).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::QuotaExceeded { required: 17, available: 9 }
        ));
        assert!(primary.load(&big.id()).await.unwrap().is_none());

        // Overwriting an item only counts the growth
        let mut grown = small.clone();
        grown.set_content("0123456789012345678");
        assert!(manager.save_item(&grown).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_saves_share_the_quota() {
        let (manager, primary, _) = manager_with(StorageConfiguration::new("local").with_quota(Some(20))).await;
        primary.set_save_delay(Some(Duration::from_millis(50)));

        let first = StorageItem::new("first", "123456789");
        let second = StorageItem::new("other", "123456789");
        let (a, b) = tokio::join!(manager.save_item(&first), manager.save_item(&second));

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|r| matches!(r, Err(StorageError::QuotaExceeded { required: 14, available: 6 }))));
        assert_eq!(primary.len(), 1);
        assert!(manager.refresh_statistics().await.used_bytes <= 20);
    }

    #[tokio::test]
    async fn test_delete_on_both_sides() {
        let (manager, primary, secondary) = manager_with(replicated()).await;
        let item = StorageItem::new("t", "c");
        manager.save_item(&item).await.unwrap();

        assert!(manager.delete_item(&item.id()).await.unwrap());
        assert!(!manager.delete_item(&item.id()).await.unwrap());
        assert!(primary.is_empty());
        assert!(secondary.is_empty());
    }

    #[tokio::test]
    async fn test_update_configuration_swaps_providers() {
        let (manager, _, secondary) = manager_with(StorageConfiguration::new("local")).await;
        let mut events = manager.subscribe_events();

        manager.update_configuration(replicated()).await.unwrap();
        assert_eq!(
            manager.configuration().secondary_provider,
            Some(ProviderId::new("local-b"))
        );
        assert_eq!(events.recv().await.unwrap(), StorageEvent::ConfigurationUpdated);

        manager.save_item(&StorageItem::new("t", "c")).await.unwrap();
        assert_eq!(secondary.len(), 1);

        let bad = StorageConfiguration::new("local").with_secondary("nowhere");
        assert!(matches!(
            manager.update_configuration(bad).await,
            Err(StorageError::ProviderNotAvailable(_))
        ));
        assert_eq!(
            manager.configuration().secondary_provider,
            Some(ProviderId::new("local-b"))
        );
    }

    #[tokio::test]
    async fn test_sync_copies_one_sided_items() {
        let (manager, primary, secondary) = manager_with(replicated()).await;
        let only_local = StorageItem::new("local only", "a");
        let only_remote = StorageItem::new("remote only", "b");
        primary.save(&only_local).await.unwrap();
        secondary.save(&only_remote).await.unwrap();

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.copied_to_primary, 1);
        assert_eq!(report.copied_to_secondary, 1);
        assert_eq!(primary.len(), 2);
        assert_eq!(secondary.len(), 2);
        assert_eq!(manager.sync_engine().state(), SyncState::Idle);
        assert!(manager.statistics().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_conflicts_surface_when_enabled() {
        let (manager, primary, secondary) = manager_with(replicated().with_sync_conflicts(true)).await;
        let item = StorageItem::new("t", "original");
        manager.save_item(&item).await.unwrap();

        let mut remote = secondary.load(&item.id()).await.unwrap().unwrap();
        remote.content = "remote edit".to_string();
        remote.set_modified_at(item.modified_at() + ChronoDuration::seconds(5));
        secondary.save(&remote).await.unwrap();

        let report = manager.sync_now().await.unwrap();
        assert_eq!(report.conflicts_detected, 1);
        assert_eq!(report.conflicts_resolved, 0);
        assert_eq!(manager.pending_conflicts().len(), 1);
        assert!(primary.load(&item.id()).await.unwrap().unwrap().sync_status.is_conflict());
        assert_eq!(manager.statistics().pending_conflicts, 1);

        let kept = manager
            .resolve_conflict(&item.id(), ConflictChoice::KeepLocal)
            .await
            .unwrap();
        assert_eq!(kept.content, "original");
        assert_eq!(secondary.load(&item.id()).await.unwrap().unwrap().content, "original");
        assert!(manager.pending_conflicts().is_empty());

        assert!(matches!(
            manager.resolve_conflict(&item.id(), ConflictChoice::KeepLocal).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_error_aborts_cycle_only() {
        let (manager, _, secondary) = manager_with(replicated()).await;
        secondary.set_offline(true);

        assert!(manager.sync_now().await.is_err());
        assert!(manager.statistics().last_sync_error.is_some());
        assert_eq!(manager.health().status, health::HealthStatus::Unhealthy);

        secondary.set_offline(false);
        manager.sync_now().await.unwrap();
        assert!(manager.statistics().last_sync_error.is_none());
    }

    #[tokio::test]
    async fn test_auto_backup_respects_interval() {
        let mut config = StorageConfiguration::new("local");
        config.auto_backup_enabled = true;
        config.auto_backup_interval = Duration::from_secs(3600);
        let (manager, _, _) = manager_with(config).await;

        assert!(manager.auto_backup_if_due().await.unwrap().is_some());
        assert!(manager.auto_backup_if_due().await.unwrap().is_none());
        assert!(manager.statistics().last_backup.is_some());
    }
}
