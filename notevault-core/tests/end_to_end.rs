/*
    End-to-end tests over the filesystem backend

    Two LocalFileProvider roots stand in for the local folder and a second
    device (`local-b`). Everything goes through the StorageManager the way an
    editor would use it.
*/

use notevault_core::crypto::{KdfParams, MemoryCredentialStore};
use notevault_core::provider::{LocalFileProvider, StorageProvider};
use notevault_core::{
    ProviderId, StorageConfiguration, StorageError, StorageItem, StorageManager, SyncState,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

struct Fixture {
    manager: Arc<StorageManager>,
    local: Arc<LocalFileProvider>,
    remote: Arc<LocalFileProvider>,
}

async fn fixture(root: &Path, config: StorageConfiguration) -> Fixture {
    let local = Arc::new(LocalFileProvider::new("local", root.join("local")).unwrap());
    let remote = Arc::new(LocalFileProvider::cloud_folder("local-b", root.join("local-b")).unwrap());
    let manager = StorageManager::builder(config)
        .shared_provider(local.clone())
        .shared_provider(remote.clone())
        .kdf_params(KdfParams::insecure_fast())
        .build()
        .await
        .unwrap();
    Fixture {
        manager,
        local,
        remote,
    }
}

fn replicated() -> StorageConfiguration {
    StorageConfiguration::new("local").with_secondary("local-b")
}

fn by_id(items: Vec<StorageItem>) -> BTreeMap<String, String> {
    items
        .into_iter()
        .map(|item| (item.id().to_string(), item.content))
        .collect()
}

/// **Scenario: edit on the second device wins after sync**
///
/// 1. Save X through the manager
/// 2. X is readable from both providers
/// 3. A newer edit lands only on `local-b`
/// 4. Sync
/// 5. `local` holds the newer edit
#[tokio::test]
async fn test_newer_remote_edit_wins_after_sync() {
    let dir = tempdir().unwrap();
    let fx = fixture(dir.path(), replicated()).await;

    let x = StorageItem::new("Groceries", "milk");
    let saved = fx.manager.save_item(&x).await.unwrap();
    assert_eq!(saved.provider, ProviderId::local());

    let on_local = fx.local.load(&x.id()).await.unwrap().unwrap();
    let on_remote = fx.remote.load(&x.id()).await.unwrap().unwrap();
    assert!(on_local.same_content(&x));
    assert!(on_remote.same_content(&x));

    let mut edited = on_remote;
    edited.set_content("milk, eggs");
    edited.set_modified_at(x.modified_at() + chrono::Duration::seconds(30));
    fx.remote.save(&edited).await.unwrap();

    let mut states = fx.manager.subscribe_sync_state();
    let report = fx.manager.sync_now().await.unwrap();
    assert_eq!(report.conflicts_detected, 1);
    assert_eq!(report.conflicts_resolved, 1);

    let after = fx.manager.load_item(&x.id()).await.unwrap().unwrap();
    assert_eq!(after.content, "milk, eggs");
    assert_eq!(
        fx.remote.load(&x.id()).await.unwrap().unwrap().content,
        "milk, eggs"
    );
    assert_eq!(*states.borrow_and_update(), SyncState::Idle);
    assert!(fx.manager.pending_conflicts().is_empty());
}

#[tokio::test]
async fn test_sync_fills_both_sides() {
    let dir = tempdir().unwrap();
    let fx = fixture(dir.path(), replicated()).await;

    let only_local = StorageItem::new("a", "written before replication was on");
    let only_remote = StorageItem::new("b", "written on the other device");
    fx.local.save(&only_local).await.unwrap();
    fx.remote.save(&only_remote).await.unwrap();

    let report = fx.manager.sync_now().await.unwrap();
    assert_eq!(report.copied_to_secondary, 1);
    assert_eq!(report.copied_to_primary, 1);

    let local = by_id(fx.local.load_all().await.unwrap());
    let remote = by_id(fx.remote.load_all().await.unwrap());
    assert_eq!(local, remote);
    assert_eq!(local.len(), 2);

    // A second pass has nothing to do
    let again = fx.manager.sync_now().await.unwrap();
    assert_eq!(again.copied_to_primary + again.copied_to_secondary, 0);
    assert_eq!(again.conflicts_detected, 0);
}

#[tokio::test]
async fn test_restore_reproduces_backed_up_items() {
    let dir = tempdir().unwrap();
    let mut config = StorageConfiguration::new("local");
    config.compression_enabled = true;
    let fx = fixture(dir.path(), config).await;

    let mut originals = Vec::new();
    for i in 0..3 {
        let item = StorageItem::new(format!("note {}", i), format!("body {}", i));
        fx.manager.save_item(&item).await.unwrap();
        originals.push(item);
    }
    let backup = fx.manager.create_backup().await.unwrap();
    assert!(backup.to_string_lossy().ends_with(".json.zst"));
    assert!(fx.manager.statistics().last_backup.is_some());

    fx.manager.delete_item(&originals[0].id()).await.unwrap();
    fx.manager
        .save_item(&StorageItem::new("after backup", ""))
        .await
        .unwrap();

    fx.manager.restore_backup(&backup).await.unwrap();
    let restored = by_id(fx.manager.load_all_items().await.unwrap());
    let expected = by_id(originals);
    assert_eq!(restored, expected);
    assert_eq!(fx.manager.statistics().total_items, 3);
}

#[tokio::test]
async fn test_corrupt_backup_leaves_items_untouched() {
    let dir = tempdir().unwrap();
    let fx = fixture(dir.path(), StorageConfiguration::new("local")).await;
    let item = StorageItem::new("keep me", "");
    fx.manager.save_item(&item).await.unwrap();

    let bogus = dir.path().join("bogus.json");
    std::fs::write(&bogus, b"{\"manifest\": 1}").unwrap();

    let err = fx.manager.restore_backup(&bogus).await.unwrap_err();
    assert!(matches!(err, StorageError::RestoreFailed(_)));
    assert!(fx.manager.load_item(&item.id()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_encrypted_on_disk_and_survives_restart() {
    let dir = tempdir().unwrap();
    let credentials = Arc::new(MemoryCredentialStore::new());
    let config = StorageConfiguration::new("local").with_encryption(true);

    let item = StorageItem::new("Diary", "nobody reads this");
    {
        let local = LocalFileProvider::new("local", dir.path().join("local")).unwrap();
        let manager = StorageManager::builder(config.clone())
            .provider(local)
            .credentials(credentials.clone())
            .kdf_params(KdfParams::insecure_fast())
            .build()
            .await
            .unwrap();
        manager.save_item(&item).await.unwrap();
    }

    let on_disk = std::fs::read_to_string(
        dir.path()
            .join("local")
            .join("items")
            .join(format!("{}.json", item.id())),
    )
    .unwrap();
    assert!(!on_disk.contains("nobody reads this"));

    // Same credentials: readable
    let reopened = StorageManager::builder(config.clone())
        .provider(LocalFileProvider::new("local", dir.path().join("local")).unwrap())
        .credentials(credentials)
        .kdf_params(KdfParams::insecure_fast())
        .build()
        .await
        .unwrap();
    let loaded = reopened.load_item(&item.id()).await.unwrap().unwrap();
    assert_eq!(loaded.content, "nobody reads this");

    // No password: fails closed
    let stranger = StorageManager::builder(config)
        .provider(LocalFileProvider::new("local", dir.path().join("local")).unwrap())
        .kdf_params(KdfParams::insecure_fast())
        .build()
        .await
        .unwrap();
    assert!(matches!(
        stranger.load_item(&item.id()).await,
        Err(StorageError::DecryptionFailed(_))
    ));
}

#[tokio::test]
async fn test_export_then_import_elsewhere() {
    let dir = tempdir().unwrap();
    let source = fixture(&dir.path().join("source"), StorageConfiguration::new("local")).await;
    for title in ["one", "two", "three"] {
        source
            .manager
            .save_item(&StorageItem::new(title, "").with_tags(["imported"]))
            .await
            .unwrap();
    }
    let export = source.manager.export_all().await.unwrap();

    let target = fixture(&dir.path().join("target"), replicated()).await;
    let mut events = target.manager.subscribe_events();
    let count = target.manager.import_from(&export).await.unwrap();
    assert_eq!(count, 3);

    let imported = target.manager.load_all_items().await.unwrap();
    assert_eq!(imported.len(), 3);
    assert!(imported.iter().all(|item| item.tags.contains("imported")));
    assert_eq!(target.remote.load_all().await.unwrap().len(), 3);

    let mut saw_import = false;
    while let Ok(event) = events.try_recv() {
        if event == (notevault_core::StorageEvent::ItemsImported { count: 3 }) {
            saw_import = true;
        }
    }
    assert!(saw_import);
}

#[tokio::test]
async fn test_versions_kept_on_overwrite() {
    let dir = tempdir().unwrap();
    let mut config = StorageConfiguration::new("local");
    config.versioning_enabled = true;
    config.max_versions = 2;
    let fx = fixture(dir.path(), config).await;

    let mut item = StorageItem::new("draft", "v0");
    fx.manager.save_item(&item).await.unwrap();
    for i in 1..=3 {
        item.set_content(format!("v{}", i));
        fx.manager.save_item(&item).await.unwrap();
    }

    let versions = fx.local.list_versions(&item.id()).await.unwrap();
    assert_eq!(versions.len(), 2);
    assert!(versions.iter().all(|v| v.content != "v3"));
}
