//! Credential store
//!
//! Abstract secure storage for per-provider encryption passwords. The concrete
//! backing (OS keychain, secret service, ...) is platform specific and lives
//! outside the core; `MemoryCredentialStore` is the in-process implementation.

use crate::model::ProviderId;
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// Credential store errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential backend unavailable: {0}")]
    Unavailable(String),

    #[error("Credential backend error: {0}")]
    Backend(String),
}

/// Helper to convert poison errors into CredentialError
fn handle_poison<T>(_err: PoisonError<T>) -> CredentialError {
    CredentialError::Backend("Lock poisoned: a thread panicked while holding the lock".to_string())
}

/// Secure password storage keyed by provider identifier
pub trait CredentialStore: Send + Sync {
    /// Store (or replace) the password for a provider
    fn set(&self, provider: &ProviderId, password: SecretString) -> Result<(), CredentialError>;

    /// Fetch the password for a provider, `None` if none is stored
    fn get(&self, provider: &ProviderId) -> Result<Option<SecretString>, CredentialError>;

    /// Remove the password for a provider; removing a missing entry is not an error
    fn delete(&self, provider: &ProviderId) -> Result<(), CredentialError>;
}

/// In-memory credential store (non-persistent)
#[derive(Clone, Default)]
pub struct MemoryCredentialStore {
    passwords: Arc<RwLock<HashMap<ProviderId, SecretString>>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor pre-populated with one password per provider
    pub fn with_passwords<I, P>(entries: I) -> Self
    where
        I: IntoIterator<Item = (P, String)>,
        P: Into<ProviderId>,
    {
        let passwords = entries
            .into_iter()
            .map(|(provider, password)| (provider.into(), SecretString::new(password)))
            .collect();
        MemoryCredentialStore {
            passwords: Arc::new(RwLock::new(passwords)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn set(&self, provider: &ProviderId, password: SecretString) -> Result<(), CredentialError> {
        self.passwords
            .write()
            .map_err(handle_poison)?
            .insert(provider.clone(), password);
        Ok(())
    }

    fn get(&self, provider: &ProviderId) -> Result<Option<SecretString>, CredentialError> {
        Ok(self.passwords.read().map_err(handle_poison)?.get(provider).cloned())
    }

    fn delete(&self, provider: &ProviderId) -> Result<(), CredentialError> {
        self.passwords.write().map_err(handle_poison)?.remove(provider);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryCredentialStore::new();
        let provider = ProviderId::local();

        assert!(store.get(&provider).unwrap().is_none());

        store
            .set(&provider, SecretString::new("hunter2".to_string()))
            .unwrap();
        let loaded = store.get(&provider).unwrap().unwrap();
        assert_eq!(loaded.expose_secret(), "hunter2");
    }

    #[test]
    fn test_memory_store_delete_is_idempotent() {
        let store = MemoryCredentialStore::with_passwords([("local", "pw".to_string())]);
        let provider = ProviderId::local();

        store.delete(&provider).unwrap();
        store.delete(&provider).unwrap();
        assert!(store.get(&provider).unwrap().is_none());
    }

    #[test]
    fn test_passwords_are_per_provider() {
        let store = MemoryCredentialStore::with_passwords([
            ("local", "a".to_string()),
            ("local-b", "b".to_string()),
        ]);

        let a = store.get(&ProviderId::new("local")).unwrap().unwrap();
        let b = store.get(&ProviderId::new("local-b")).unwrap().unwrap();
        assert_ne!(a.expose_secret(), b.expose_secret());
    }
}
