/*
    local.rs - Filesystem provider

    Layout under the provider root:
        items/<id>.json                 one record per item
        versions/<id>/<timestamp>.json  previous records (when versioning is on)
        backups/backup-<ts>.json[.zst]  archives
        exports/export-<ts>.json        interchange documents

    Record writes go through a temp file + rename, so a concurrent reader sees
    either the old record or the new one. Restore stages the archive into a
    sibling directory and swaps it in only after every record was written.

    The same implementation serves cloud-synced folders: point the root at the
    folder the sync client watches and declare `ProviderKind::CloudFolder`.
*/

use super::archive::{self, timestamped_name};
use super::fs::{is_temp_file, write_atomic};
use super::{ProviderOptions, StorageProvider};
use crate::error::{StorageError, StorageResult};
use crate::model::{ItemId, ProviderId, ProviderKind, StorageItem};
use async_trait::async_trait;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info, warn};

const ITEMS_DIR: &str = "items";
const VERSIONS_DIR: &str = "versions";
const BACKUPS_DIR: &str = "backups";
const EXPORTS_DIR: &str = "exports";

fn handle_poison<T>(_err: PoisonError<T>) -> StorageError {
    StorageError::Internal("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// Provider that keeps one JSON file per item under a root directory
pub struct LocalFileProvider {
    id: ProviderId,
    kind: ProviderKind,
    root: PathBuf,
    options: RwLock<ProviderOptions>,
}

impl LocalFileProvider {
    /// Create a provider rooted at `root`, creating the directory layout
    pub fn new(id: impl Into<ProviderId>, root: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::with_kind(id, root, ProviderKind::LocalFilesystem)
    }

    /// A provider over a folder mirrored by a cloud sync client
    pub fn cloud_folder(id: impl Into<ProviderId>, root: impl Into<PathBuf>) -> StorageResult<Self> {
        Self::with_kind(id, root, ProviderKind::CloudFolder)
    }

    fn with_kind(
        id: impl Into<ProviderId>,
        root: impl Into<PathBuf>,
        kind: ProviderKind,
    ) -> StorageResult<Self> {
        let root = root.into();
        for dir in [ITEMS_DIR, VERSIONS_DIR, BACKUPS_DIR, EXPORTS_DIR] {
            std::fs::create_dir_all(root.join(dir))?;
        }

        Ok(LocalFileProvider {
            id: id.into(),
            kind,
            root,
            options: RwLock::new(ProviderOptions::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn items_dir(&self) -> PathBuf {
        self.root.join(ITEMS_DIR)
    }

    fn item_path(&self, id: &ItemId) -> PathBuf {
        self.items_dir().join(format!("{}.json", id))
    }

    fn versions_dir(&self, id: &ItemId) -> PathBuf {
        self.root.join(VERSIONS_DIR).join(id.to_string())
    }

    fn options(&self) -> StorageResult<ProviderOptions> {
        Ok(self.options.read().map_err(handle_poison)?.clone())
    }

    /// Read and parse a record; `Ok(None)` when it does not exist
    async fn read_record(path: &Path) -> StorageResult<Option<StorageItem>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let item: StorageItem = serde_json::from_slice(&bytes)?;
        item.validate()?;
        Ok(Some(item))
    }

    /// Read every record in a directory, skipping temp files and unreadable records
    async fn read_dir_records(dir: &Path) -> StorageResult<Vec<StorageItem>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut items = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp_file(&path) || path.extension().map(|e| e != "json").unwrap_or(true) {
                continue;
            }
            match Self::read_record(&path).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }
        Ok(items)
    }

    /// Move the current record of `item` into its version history
    ///
    /// Rewrites that only touch replication bookkeeping keep no version.
    async fn archive_previous(&self, item: &StorageItem, new_bytes: &[u8], max_versions: usize) -> StorageResult<()> {
        let id = &item.id();
        let current = self.item_path(id);
        let previous = match tokio::fs::read(&current).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if previous == new_bytes {
            return Ok(());
        }
        if let Ok(prior) = serde_json::from_slice::<StorageItem>(&previous) {
            if prior.same_content(item) {
                return Ok(());
            }
        }

        let dir = self.versions_dir(id);
        tokio::fs::create_dir_all(&dir).await?;
        let name = format!("{}.json", timestamped_name("v", Utc::now()));
        write_atomic(&dir.join(name), &previous).await?;

        self.prune_versions(id, max_versions).await
    }

    async fn prune_versions(&self, id: &ItemId, keep: usize) -> StorageResult<()> {
        let mut files = Self::sorted_files(&self.versions_dir(id)).await?;
        while files.len() > keep {
            let oldest = files.remove(0);
            tokio::fs::remove_file(&oldest).await?;
        }
        Ok(())
    }

    /// Non-temp files of a directory, oldest first (names embed timestamps)
    async fn sorted_files(dir: &Path) -> StorageResult<Vec<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file() && !is_temp_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Previous records of an item, oldest first
    pub async fn list_versions(&self, id: &ItemId) -> StorageResult<Vec<StorageItem>> {
        let mut versions = Vec::new();
        for path in Self::sorted_files(&self.versions_dir(id)).await? {
            if let Some(item) = Self::read_record(&path).await? {
                versions.push(item);
            }
        }
        Ok(versions)
    }

    /// Backup archives on disk, oldest first
    pub async fn list_backups(&self) -> StorageResult<Vec<PathBuf>> {
        Self::sorted_files(&self.root.join(BACKUPS_DIR)).await
    }

    /// Delete all but the newest `keep` backups; returns how many were removed
    pub async fn cleanup_old_backups(&self, keep: usize) -> StorageResult<usize> {
        let backups = self.list_backups().await?;
        let excess = backups.len().saturating_sub(keep);
        for path in &backups[..excess] {
            tokio::fs::remove_file(path).await?;
            debug!(path = %path.display(), "Removed old backup");
        }
        Ok(excess)
    }

    async fn write_staging(dir: &Path, items: &[StorageItem]) -> StorageResult<()> {
        tokio::fs::create_dir_all(dir).await?;
        for item in items {
            let bytes = serde_json::to_vec_pretty(item)?;
            write_atomic(&dir.join(format!("{}.json", item.id())), &bytes).await?;
        }
        Ok(())
    }

    /// Replace the items directory with `staging`, rolling back on failure
    async fn swap_in(&self, staging: &Path) -> StorageResult<()> {
        let live = self.items_dir();
        let retired = self
            .root
            .join(format!("{}.old-{}", ITEMS_DIR, uuid::Uuid::new_v4().simple()));

        tokio::fs::rename(&live, &retired).await?;
        if let Err(e) = tokio::fs::rename(staging, &live).await {
            tokio::fs::rename(&retired, &live).await?;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::remove_dir_all(&retired).await {
            warn!(path = %retired.display(), error = %e, "Failed to remove retired items directory");
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for LocalFileProvider {
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
        let bytes = serde_json::to_vec_pretty(item)?;

        let options = self.options()?;
        if options.keep_versions {
            self.archive_previous(item, &bytes, options.max_versions)
                .await?;
        }

        write_atomic(&self.item_path(&item.id()), &bytes).await?;
        debug!(provider = %self.id, item = %item.id(), "Saved record");
        Ok(())
    }

    async fn load(&self, id: &ItemId) -> StorageResult<Option<StorageItem>> {
        Self::read_record(&self.item_path(id)).await
    }

    async fn load_all(&self) -> StorageResult<Vec<StorageItem>> {
        Self::read_dir_records(&self.items_dir()).await
    }

    async fn delete(&self, id: &ItemId) -> StorageResult<bool> {
        let existed = match tokio::fs::remove_file(self.item_path(id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        match tokio::fs::remove_dir_all(self.versions_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(item = %id, error = %e, "Failed to remove version history"),
        }
        Ok(existed)
    }

    async fn create_backup(&self) -> StorageResult<PathBuf> {
        let items = self
            .load_all()
            .await
            .map_err(|e| StorageError::BackupFailed(e.to_string()))?;
        let compress = self.options()?.compress_backups;
        let bytes = archive::encode_backup(&self.id, &items, compress)?;

        let extension = if compress { "json.zst" } else { "json" };
        let path = self.root.join(BACKUPS_DIR).join(format!(
            "{}.{}",
            timestamped_name("backup", Utc::now()),
            extension
        ));
        write_atomic(&path, &bytes)
            .await
            .map_err(|e| StorageError::BackupFailed(e.to_string()))?;

        info!(provider = %self.id, items = items.len(), path = %path.display(), "Backup created");
        Ok(path)
    }

    async fn restore_backup(&self, location: &Path) -> StorageResult<()> {
        let bytes = tokio::fs::read(location)
            .await
            .map_err(|e| StorageError::RestoreFailed(format!("{}: {}", location.display(), e)))?;
        let (manifest, items) = archive::decode_backup(&bytes)?;

        let staging = self
            .root
            .join(format!("{}.restore-{}", ITEMS_DIR, uuid::Uuid::new_v4().simple()));
        let staged = async {
            Self::write_staging(&staging, &items).await?;
            self.swap_in(&staging).await
        }
        .await;

        if let Err(e) = staged {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(StorageError::RestoreFailed(e.to_string()));
        }

        info!(
            provider = %self.id,
            items = items.len(),
            archived_at = %manifest.created_at,
            "Backup restored"
        );
        Ok(())
    }

    async fn export_all(&self) -> StorageResult<PathBuf> {
        let items = self.load_all().await?;
        let bytes = archive::encode_export(&items)?;
        let path = self
            .root
            .join(EXPORTS_DIR)
            .join(format!("{}.json", timestamped_name("export", Utc::now())));
        write_atomic(&path, &bytes).await?;

        info!(provider = %self.id, items = items.len(), path = %path.display(), "Export written");
        Ok(path)
    }

    async fn import_from(&self, location: &Path) -> StorageResult<usize> {
        let bytes = tokio::fs::read(location).await?;
        let items = archive::decode_export(&bytes)?;

        let mut imported = 0;
        for item in &items {
            match self.save(item).await {
                Ok(()) => imported += 1,
                Err(e) => warn!(item = %item.id(), error = %e, "Failed to import record"),
            }
        }
        info!(provider = %self.id, imported, "Import finished");
        Ok(imported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncStatus;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalFileProvider) {
        let dir = TempDir::new().unwrap();
        let provider = LocalFileProvider::new("local", dir.path()).unwrap();
        (dir, provider)
    }

    #[tokio::test]
    async fn test_save_load_roundtrip() {
        let (_dir, provider) = setup();
        let item = StorageItem::new("title", "body").with_tags(["a", "b"]);

        provider.save(&item).await.unwrap();
        let loaded = provider.load(&item.id()).await.unwrap().unwrap();
        assert_eq!(loaded, item);
    }

    #[tokio::test]
    async fn test_load_missing_is_none() {
        let (_dir, provider) = setup();
        assert!(provider.load(&ItemId::generate()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resave_keeps_single_record() {
        let (_dir, provider) = setup();
        let item = StorageItem::new("t", "c");

        provider.save(&item).await.unwrap();
        provider.save(&item).await.unwrap();
        assert_eq!(provider.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let (_dir, provider) = setup();
        let item = StorageItem::new("t", "c");
        provider.save(&item).await.unwrap();

        assert!(provider.delete(&item.id()).await.unwrap());
        assert!(!provider.delete(&item.id()).await.unwrap());
        assert!(provider.load(&item.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_all_skips_corrupt_and_temp_files() {
        let (dir, provider) = setup();
        let item = StorageItem::new("t", "c");
        provider.save(&item).await.unwrap();

        let items_dir = dir.path().join(ITEMS_DIR);
        std::fs::write(items_dir.join("garbage.json"), b"{ not json").unwrap();
        std::fs::write(items_dir.join("half.json.1234.tmp"), b"{").unwrap();

        let all = provider.load_all().await.unwrap();
        assert_eq!(all, vec![item]);
    }

    #[tokio::test]
    async fn test_backup_restore_replaces_contents() {
        let (_dir, provider) = setup();
        let kept = StorageItem::new("kept", "1");
        provider.save(&kept).await.unwrap();

        let backup = provider.create_backup().await.unwrap();
        assert!(backup.exists());

        let later = StorageItem::new("later", "2");
        provider.save(&later).await.unwrap();
        provider.delete(&kept.id()).await.unwrap();

        provider.restore_backup(&backup).await.unwrap();
        let all = provider.load_all().await.unwrap();
        assert_eq!(all, vec![kept]);
    }

    #[tokio::test]
    async fn test_failed_restore_leaves_store_untouched() {
        let (dir, provider) = setup();
        let item = StorageItem::new("t", "c");
        provider.save(&item).await.unwrap();

        let bogus = dir.path().join("bogus.json");
        std::fs::write(&bogus, b"not an archive").unwrap();

        let err = provider.restore_backup(&bogus).await.unwrap_err();
        assert!(matches!(err, StorageError::RestoreFailed(_)));
        assert_eq!(provider.load_all().await.unwrap(), vec![item]);

        let missing = provider.restore_backup(&dir.path().join("nope.json")).await;
        assert!(matches!(missing, Err(StorageError::RestoreFailed(_))));
    }

    #[tokio::test]
    async fn test_compressed_backup() {
        let (_dir, provider) = setup();
        provider.configure(&ProviderOptions {
            compress_backups: true,
            ..ProviderOptions::default()
        });
        provider.save(&StorageItem::new("t", "c".repeat(4096))).await.unwrap();

        let backup = provider.create_backup().await.unwrap();
        assert!(backup.to_string_lossy().ends_with(".json.zst"));
        provider.restore_backup(&backup).await.unwrap();
        assert_eq!(provider.load_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_old_backups_keeps_newest() {
        let (_dir, provider) = setup();
        provider.save(&StorageItem::new("t", "c")).await.unwrap();

        let mut created = Vec::new();
        for _ in 0..3 {
            created.push(provider.create_backup().await.unwrap());
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(provider.cleanup_old_backups(1).await.unwrap(), 2);
        assert_eq!(provider.list_backups().await.unwrap(), vec![created[2].clone()]);
    }

    #[tokio::test]
    async fn test_export_import_between_providers() {
        let (_dir_a, a) = setup();
        let (_dir_b, b) = setup();
        for i in 0..3 {
            a.save(&StorageItem::new(format!("n{}", i), "x")).await.unwrap();
        }

        let export = a.export_all().await.unwrap();
        assert_eq!(b.import_from(&export).await.unwrap(), 3);
        assert_eq!(b.load_all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_versioning_keeps_bounded_history() {
        let (_dir, provider) = setup();
        provider.configure(&ProviderOptions {
            keep_versions: true,
            max_versions: 2,
            ..ProviderOptions::default()
        });

        let mut item = StorageItem::new("t", "v0");
        provider.save(&item).await.unwrap();
        for i in 1..=4 {
            item.set_content(format!("v{}", i));
            provider.save(&item).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let versions = provider.list_versions(&item.id()).await.unwrap();
        let contents: Vec<_> = versions.iter().map(|v| v.content.as_str()).collect();
        assert_eq!(contents, vec!["v2", "v3"]);
        assert_eq!(provider.load(&item.id()).await.unwrap().unwrap().content, "v4");
    }

    #[tokio::test]
    async fn test_status_change_keeps_no_version() {
        let (_dir, provider) = setup();
        provider.configure(&ProviderOptions {
            keep_versions: true,
            max_versions: 5,
            ..ProviderOptions::default()
        });

        let mut item = StorageItem::new("t", "body");
        provider.save(&item).await.unwrap();
        item.sync_status = SyncStatus::Uploading;
        provider.save(&item).await.unwrap();
        item.sync_status = SyncStatus::Synced;
        provider.save(&item).await.unwrap();

        assert!(provider.list_versions(&item.id()).await.unwrap().is_empty());
    }
}
