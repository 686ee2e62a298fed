//! [`SecretStore`] on the platform keyring (Keychain, Secret Service,
//! Credential Manager).

use async_trait::async_trait;
use keyring::Entry;

use super::{Secret, SecretStore, StoreError};

/// Each key is stored as the "user" of an entry whose service is the
/// namespace, so all of a host's profiles appear together in keychain UIs.
#[derive(Debug, Clone)]
pub struct KeyringStore {
    service: String,
}

impl KeyringStore {
    /// Fails with [`StoreError::Unavailable`] when no keyring backend can be
    /// constructed on this host.
    pub fn try_new(service: &str) -> Result<Self, StoreError> {
        Entry::new(service, "availability-check").map_err(|e| StoreError::Unavailable {
            message: e.to_string(),
        })?;
        Ok(Self {
            service: service.to_string(),
        })
    }

    fn entry(&self, key: &str) -> Result<Entry, StoreError> {
        Entry::new(&self.service, key).map_err(|e| backend(key, e))
    }
}

fn backend(key: &str, e: keyring::Error) -> StoreError {
    StoreError::Backend {
        key: key.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl SecretStore for KeyringStore {
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(Secret::new(value))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(backend(key, e)),
        }
    }

    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(secret.expose())
            .map_err(|e| backend(key, e))
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(backend(key, e)),
        }
    }

    async fn list_keys(&self, _prefix: &str) -> Result<Vec<String>, StoreError> {
        // keyring has no enumeration API
        Err(StoreError::Unsupported {
            operation: "list_keys",
        })
    }
}
