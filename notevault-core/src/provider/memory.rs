/*
    memory.rs - Volatile in-process provider

    Backups and exports live in an in-memory map keyed by a synthetic path,
    so the provider never touches disk unless asked to import a real file.
    Failure injection and save recording make it the workhorse for testing
    the manager, sync engine and auto-save queue.
*/

use super::archive::{self, timestamped_name};
use super::{ProviderOptions, StorageProvider};
use crate::error::{StorageError, StorageResult};
use crate::model::{ItemId, ProviderId, ProviderKind, StorageItem};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::Duration;

fn handle_poison<T>(_err: PoisonError<T>) -> StorageError {
    StorageError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// In-memory provider with failure injection
pub struct MemoryProvider {
    id: ProviderId,
    kind: ProviderKind,
    items: RwLock<HashMap<ItemId, StorageItem>>,
    documents: RwLock<HashMap<PathBuf, Vec<u8>>>,
    options: RwLock<ProviderOptions>,
    offline: AtomicBool,
    failing_saves: AtomicUsize,
    save_delay: Mutex<Option<Duration>>,
    save_log: Mutex<Vec<ItemId>>,
}

impl MemoryProvider {
    pub fn new(id: impl Into<ProviderId>) -> Self {
        Self::with_kind(id, ProviderKind::Memory)
    }

    /// Present as another backend kind, e.g. to stand in for a note service
    pub fn with_kind(id: impl Into<ProviderId>, kind: ProviderKind) -> Self {
        MemoryProvider {
            id: id.into(),
            kind,
            items: RwLock::new(HashMap::new()),
            documents: RwLock::new(HashMap::new()),
            options: RwLock::new(ProviderOptions::default()),
            offline: AtomicBool::new(false),
            failing_saves: AtomicUsize::new(0),
            save_delay: Mutex::new(None),
            save_log: Mutex::new(Vec::new()),
        }
    }

    /// Make every operation fail until set back to false
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` saves
    pub fn fail_next_saves(&self, count: usize) {
        self.failing_saves.store(count, Ordering::SeqCst);
    }

    /// Sleep this long inside every save
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        match self.save_delay.lock() {
            Ok(mut current) => *current = delay,
            Err(poisoned) => *poisoned.into_inner() = delay,
        }
    }

    /// Ids of successful saves, in completion order
    pub fn saved_order(&self) -> Vec<ItemId> {
        self.save_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Currently applied options
    pub fn options(&self) -> ProviderOptions {
        self.options
            .read()
            .map(|options| options.clone())
            .unwrap_or_default()
    }

    fn check_online(&self) -> StorageResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StorageError::Storage(format!("provider {} is offline", self.id)));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn synthetic_path(&self, prefix: &str) -> PathBuf {
        PathBuf::from(format!("memory://{}", self.id))
            .join(format!("{}.json", timestamped_name(prefix, Utc::now())))
    }

    async fn read_document(&self, location: &Path) -> StorageResult<Vec<u8>> {
        let stored = self
            .documents
            .read()
            .map_err(handle_poison)?
            .get(location)
            .cloned();
        match stored {
            Some(bytes) => Ok(bytes),
            None => Ok(tokio::fs::read(location).await?),
        }
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn configure(&self, options: &ProviderOptions) {
        match self.options.write() {
            Ok(mut current) => *current = options.clone(),
            Err(poisoned) => *poisoned.into_inner() = options.clone(),
        }
    }

    async fn save(&self, item: &StorageItem) -> StorageResult<()> {
        self.check_online()?;

        let delay = *self.save_delay.lock().map_err(handle_poison)?;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_injected_failure() {
            return Err(StorageError::Storage(format!(
                "injected save failure on {}",
                self.id
            )));
        }

        self.items
            .write()
            .map_err(handle_poison)?
            .insert(item.id(), item.clone());
        self.save_log.lock().map_err(handle_poison)?.push(item.id());
        Ok(())
    }

    async fn load(&self, id: &ItemId) -> StorageResult<Option<StorageItem>> {
        self.check_online()?;
        Ok(self.items.read().map_err(handle_poison)?.get(id).cloned())
    }

    async fn load_all(&self) -> StorageResult<Vec<StorageItem>> {
        self.check_online()?;
        Ok(self
            .items
            .read()
            .map_err(handle_poison)?
            .values()
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &ItemId) -> StorageResult<bool> {
        self.check_online()?;
        Ok(self.items.write().map_err(handle_poison)?.remove(id).is_some())
    }

    async fn create_backup(&self) -> StorageResult<PathBuf> {
        self.check_online()
            .map_err(|e| StorageError::BackupFailed(e.to_string()))?;
        let items = self.load_all().await?;
        let compress = self.options().compress_backups;
        let bytes = archive::encode_backup(&self.id, &items, compress)?;

        let path = self.synthetic_path("backup");
        self.documents
            .write()
            .map_err(handle_poison)?
            .insert(path.clone(), bytes);
        Ok(path)
    }

    async fn restore_backup(&self, location: &Path) -> StorageResult<()> {
        self.check_online()
            .map_err(|e| StorageError::RestoreFailed(e.to_string()))?;
        let bytes = self
            .read_document(location)
            .await
            .map_err(|e| StorageError::RestoreFailed(e.to_string()))?;
        let (_, items) = archive::decode_backup(&bytes)?;

        let restored: HashMap<_, _> = items.into_iter().map(|item| (item.id(), item)).collect();
        *self.items.write().map_err(handle_poison)? = restored;
        Ok(())
    }

    async fn export_all(&self) -> StorageResult<PathBuf> {
        let items = self.load_all().await?;
        let bytes = archive::encode_export(&items)?;

        let path = self.synthetic_path("export");
        self.documents
            .write()
            .map_err(handle_poison)?
            .insert(path.clone(), bytes);
        Ok(path)
    }

    async fn import_from(&self, location: &Path) -> StorageResult<usize> {
        self.check_online()?;
        let bytes = self.read_document(location).await?;
        let items = archive::decode_export(&bytes)?;

        let mut imported = 0;
        for item in &items {
            if self.save(item).await.is_ok() {
                imported += 1;
            }
        }
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_basic_crud() {
        let provider = MemoryProvider::new("mem");
        let item = StorageItem::new("t", "c");

        provider.save(&item).await.unwrap();
        assert_eq!(provider.load(&item.id()).await.unwrap(), Some(item.clone()));
        assert!(provider.delete(&item.id()).await.unwrap());
        assert!(provider.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = MemoryProvider::new("mem");
        provider.fail_next_saves(2);
        let item = StorageItem::new("t", "c");

        assert!(provider.save(&item).await.is_err());
        assert!(provider.save(&item).await.is_err());
        assert!(provider.save(&item).await.is_ok());
        assert_eq!(provider.saved_order(), vec![item.id()]);
    }

    #[tokio::test]
    async fn test_offline_rejects_everything() {
        let provider = MemoryProvider::new("mem");
        provider.set_offline(true);

        assert!(provider.save(&StorageItem::new("t", "c")).await.is_err());
        assert!(provider.load_all().await.is_err());
        assert!(matches!(
            provider.create_backup().await,
            Err(StorageError::BackupFailed(_))
        ));

        provider.set_offline(false);
        assert!(provider.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_backup_restore() {
        let provider = MemoryProvider::new("mem");
        let item = StorageItem::new("t", "c");
        provider.save(&item).await.unwrap();

        let backup = provider.create_backup().await.unwrap();
        provider.delete(&item.id()).await.unwrap();
        provider.save(&StorageItem::new("other", "x")).await.unwrap();

        provider.restore_backup(&backup).await.unwrap();
        assert_eq!(provider.load_all().await.unwrap(), vec![item]);
    }
}
