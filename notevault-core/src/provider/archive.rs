/*
    archive.rs - Backup archives and the interchange document

    Backup layout (JSON, optionally wrapped in a zstd frame):
    {
        "manifest": { format_version, created_at, provider, item_count, checksum },
        "items": [ StorageItem, ... ]
    }

    The checksum is the blake3 hash of the serialized `items` array, so a
    restore can refuse a truncated or edited archive before touching the store.

    Interchange (export/import) is a plain JSON array of StorageItem records.
*/

use crate::error::{StorageError, StorageResult};
use crate::model::{ProviderId, StorageItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Current archive format
pub const FORMAT_VERSION: u32 = 1;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const ZSTD_LEVEL: i32 = 3;

/// Metadata header of a backup archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub provider: ProviderId,
    pub item_count: usize,
    /// blake3 of the serialized item list (hex)
    pub checksum: String,
}

#[derive(Serialize)]
struct ArchiveRef<'a> {
    manifest: &'a BackupManifest,
    items: &'a [StorageItem],
}

#[derive(Deserialize)]
struct ArchiveOwned {
    manifest: BackupManifest,
    items: Vec<StorageItem>,
}

fn items_checksum(items: &[StorageItem]) -> StorageResult<String> {
    let bytes = serde_json::to_vec(items)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

/// File name stem shared by backups and exports, sortable by creation time
pub fn timestamped_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        at.format("%Y%m%dT%H%M%S%3fZ"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

/// Serialize a backup archive of `items`
pub fn encode_backup(
    provider: &ProviderId,
    items: &[StorageItem],
    compress: bool,
) -> StorageResult<Vec<u8>> {
    let manifest = BackupManifest {
        format_version: FORMAT_VERSION,
        created_at: Utc::now(),
        provider: provider.clone(),
        item_count: items.len(),
        checksum: items_checksum(items).map_err(|e| StorageError::BackupFailed(e.to_string()))?,
    };

    let json = serde_json::to_vec(&ArchiveRef {
        manifest: &manifest,
        items,
    })
    .map_err(|e| StorageError::BackupFailed(e.to_string()))?;

    if compress {
        zstd::encode_all(&json[..], ZSTD_LEVEL)
            .map_err(|e| StorageError::BackupFailed(format!("compression failed: {}", e)))
    } else {
        Ok(json)
    }
}

pub fn is_compressed(bytes: &[u8]) -> bool {
    bytes.starts_with(&ZSTD_MAGIC)
}

/// Parse and fully verify a backup archive
///
/// Every failure maps to `RestoreFailed`; nothing is returned unless the
/// manifest, checksum and every record check out.
pub fn decode_backup(bytes: &[u8]) -> StorageResult<(BackupManifest, Vec<StorageItem>)> {
    let json = if is_compressed(bytes) {
        zstd::decode_all(bytes)
            .map_err(|e| StorageError::RestoreFailed(format!("decompression failed: {}", e)))?
    } else {
        bytes.to_vec()
    };

    let archive: ArchiveOwned = serde_json::from_slice(&json)
        .map_err(|e| StorageError::RestoreFailed(format!("unreadable archive: {}", e)))?;

    let manifest = archive.manifest;
    if manifest.format_version > FORMAT_VERSION {
        return Err(StorageError::RestoreFailed(format!(
            "unsupported archive format {}",
            manifest.format_version
        )));
    }
    if manifest.item_count != archive.items.len() {
        return Err(StorageError::RestoreFailed(format!(
            "archive declares {} items but contains {}",
            manifest.item_count,
            archive.items.len()
        )));
    }

    let checksum = items_checksum(&archive.items)
        .map_err(|e| StorageError::RestoreFailed(e.to_string()))?;
    if checksum != manifest.checksum {
        return Err(StorageError::RestoreFailed("checksum mismatch".to_string()));
    }

    for item in &archive.items {
        item.validate()
            .map_err(|e| StorageError::RestoreFailed(e.to_string()))?;
    }

    Ok((manifest, archive.items))
}

/// Serialize the interchange document
pub fn encode_export(items: &[StorageItem]) -> StorageResult<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(items)?)
}

/// Parse an interchange document, keeping every well-formed record
///
/// Records that fail to parse or validate are skipped with a warning; a
/// document that is not a JSON array at all is an error.
pub fn decode_export(bytes: &[u8]) -> StorageResult<Vec<StorageItem>> {
    let values: Vec<serde_json::Value> = serde_json::from_slice(bytes)?;
    let total = values.len();

    let items: Vec<StorageItem> = values
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| {
            match serde_json::from_value::<StorageItem>(value) {
                Ok(item) => match item.validate() {
                    Ok(()) => Some(item),
                    Err(e) => {
                        warn!(index, error = %e, "Skipping invalid record in import");
                        None
                    }
                },
                Err(e) => {
                    warn!(index, error = %e, "Skipping malformed record in import");
                    None
                }
            }
        })
        .collect();

    if items.len() < total {
        warn!(
            accepted = items.len(),
            rejected = total - items.len(),
            "Import document contained unusable records"
        );
    }
    Ok(items)
}
