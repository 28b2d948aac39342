//! Provider registry: ProviderId -> backend implementation

use crate::error::{StorageError, StorageResult};
use crate::model::ProviderId;
use crate::provider::StorageProvider;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Every backend the manager can activate, keyed by id
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<ProviderId, Arc<dyn StorageProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own id; returns the backend it replaced
    pub fn register(&mut self, provider: Arc<dyn StorageProvider>) -> Option<Arc<dyn StorageProvider>> {
        self.providers.insert(provider.id().clone(), provider)
    }

    pub fn get(&self, id: &ProviderId) -> StorageResult<Arc<dyn StorageProvider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::ProviderNotAvailable(id.clone()))
    }

    pub fn contains(&self, id: &ProviderId) -> bool {
        self.providers.contains_key(id)
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    #[test]
    fn test_lookup_and_missing_provider() {
        let mut registry = ProviderRegistry::new();
        assert!(registry.register(Arc::new(MemoryProvider::new("local"))).is_none());

        assert!(registry.get(&ProviderId::local()).is_ok());
        let err = registry.get(&ProviderId::new("dropbox")).err().unwrap();
        assert!(matches!(err, StorageError::ProviderNotAvailable(ref id) if id.as_str() == "dropbox"));
    }

    #[test]
    fn test_reregister_replaces() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MemoryProvider::new("local")));
        assert!(registry.register(Arc::new(MemoryProvider::new("local"))).is_some());
        assert_eq!(registry.len(), 1);
    }
}
