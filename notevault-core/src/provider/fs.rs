//! Filesystem helpers for crash-safe record writes

use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Suffix of in-progress writes; readers skip these files
pub const TEMP_SUFFIX: &str = "tmp";

/// Unique sibling path for a pending write of `destination`
pub fn temp_path_for(destination: &Path) -> PathBuf {
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    destination.with_file_name(format!("{}.{}.{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX))
}

pub fn is_temp_file(path: &Path) -> bool {
    path.extension().map(|ext| ext == TEMP_SUFFIX).unwrap_or(false)
}

/// Write `bytes` to `destination` so readers observe either the old or the new file
///
/// The data is flushed to disk before the rename. A failed write removes the
/// temp file and leaves `destination` untouched.
pub async fn write_atomic(destination: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = temp_path_for(destination);

    let written = async {
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        Ok::<_, io::Error>(())
    }
    .await;

    if let Err(e) = written {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(e);
    }

    rename_with_fallback(&temp_path, destination).await
}

/// Rename, retrying once after removing the target for platforms where
/// rename refuses to overwrite
pub async fn rename_with_fallback(temp_path: &Path, destination: &Path) -> io::Result<()> {
    if let Err(initial_err) = tokio::fs::rename(temp_path, destination).await {
        let _ = tokio::fs::remove_file(destination).await;
        if let Err(retry_err) = tokio::fs::rename(temp_path, destination).await {
            let _ = tokio::fs::remove_file(temp_path).await;
            return Err(io::Error::new(
                retry_err.kind(),
                format!(
                    "Atomic rename failed (initial: {}, retry: {})",
                    initial_err, retry_err
                ),
            ));
        }
    }
    Ok(())
}
