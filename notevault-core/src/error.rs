/*
    error.rs - Error types for the storage engine

    Defines all error types that can occur in:
    - Provider I/O
    - Encryption and credential lookup
    - Backup, restore and interchange
    - Synchronization
*/

use crate::crypto::credentials::CredentialError;
use crate::model::{ProviderId, StorageItem};
use thiserror::Error;

/// Errors surfaced by the storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    /// A configured provider has no registered implementation
    #[error("Provider not available: {0}")]
    ProviderNotAvailable(ProviderId),

    /// Saving would push the primary provider past the configured quota
    #[error("Storage quota exceeded: {required} bytes required, {available} bytes available")]
    QuotaExceeded { required: u64, available: u64 },

    /// The cipher step failed; the item was not written
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext could not be opened (wrong key or tampered data)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// The versions a resolution was chosen against have changed since
    /// the conflict was detected; carries the current pair
    #[error("Sync conflict on item {}", .local.id())]
    SyncConflict {
        local: Box<StorageItem>,
        remote: Box<StorageItem>,
    },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    /// Restore aborted; the store is unchanged
    #[error("Restore failed: {0}")]
    RestoreFailed(String),

    /// Storage I/O error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Record (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error (should not happen)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<CredentialError> for StorageError {
    fn from(err: CredentialError) -> Self {
        StorageError::Credential(err.to_string())
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        StorageError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::ProviderNotAvailable(ProviderId::new("dropbox"));
        assert_eq!(err.to_string(), "Provider not available: dropbox");
    }

    #[test]
    fn test_quota_error_display() {
        let err = StorageError::QuotaExceeded {
            required: 120,
            available: 100,
        };
        assert!(err.to_string().contains("120 bytes required"));
        assert!(err.to_string().contains("100 bytes available"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let err: StorageError = io.into();
        assert!(matches!(err, StorageError::Storage(_)));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let err: StorageError = json_err.into();
        assert!(matches!(err, StorageError::Serialization(_)));
    }
}
