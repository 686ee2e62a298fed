//! Process-local [`SecretStore`], used in tests and when no keyring exists.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Secret, SecretStore, StoreError};

/// Contents vanish at process exit.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Secret>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store, handy for seeding a profile in tests.
    pub fn with_entries<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Secret)>,
        K: Into<String>,
    {
        Self {
            entries: RwLock::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MemoryStore({} entries)", self.len())
    }
}

#[async_trait]
impl SecretStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.entries.write().insert(key.to_owned(), secret.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // BTreeMap iterates in key order.
        Ok(self
            .entries
            .read()
            .range(prefix.to_owned()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}
