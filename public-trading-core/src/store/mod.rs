//! Where the trading secret and cached tokens live between runs.
//!
//! Everything is addressed by a flat string key built with [`secret_key`]:
//! `public-trading/{profile}/{entry}`. Two backends exist, the OS keyring
//! ([`KeyringStore`], feature `keyring-store`) and a process-local
//! [`MemoryStore`]. [`create_store`] picks one at startup.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

mod memory;
#[cfg(feature = "keyring-store")]
mod keyring;

pub use memory::MemoryStore;
#[cfg(feature = "keyring-store")]
pub use keyring::KeyringStore;

/// Keyring service name and first key segment.
pub const STORE_NAMESPACE: &str = "public-trading";

/// Sensitive string: the trading secret or a bearer token.
///
/// Formatting never prints the value and the buffer is wiped on drop.
/// Call [`expose`](Secret::expose) at the point of use only.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Empty or whitespace only.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// `public-trading/{profile}/{entry}`
///
/// ```
/// use public_trading_core::store::secret_key;
///
/// assert_eq!(secret_key("default", "secret"), "public-trading/default/secret");
/// ```
pub fn secret_key(profile: &str, entry: &str) -> String {
    format!("{}/{}/{}", STORE_NAMESPACE, profile, entry)
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing one key failed.
    #[error("secret store failed for {key}: {message}")]
    Backend { key: String, message: String },

    /// The backend cannot serve this operation at all.
    #[error("secret store does not support {operation}")]
    Unsupported { operation: &'static str },

    /// No usable keyring on this host.
    #[error("OS keyring unavailable: {message}")]
    Unavailable { message: String },
}

/// Key/value storage for [`Secret`]s.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// `Ok(None)` when nothing is stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Secret>, StoreError>;

    /// Insert or overwrite.
    async fn set(&self, key: &str, secret: &Secret) -> Result<(), StoreError>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// The OS keyring when `prefer_keyring` is set and one is reachable,
/// otherwise a [`MemoryStore`]. Falling back means cached tokens are lost
/// at exit, so it is logged at `warn`.
pub fn create_store(prefer_keyring: bool) -> Box<dyn SecretStore> {
    if prefer_keyring {
        match keyring_store() {
            Ok(store) => {
                tracing::debug!(namespace = STORE_NAMESPACE, "Using OS keyring");
                return store;
            }
            Err(e) => tracing::warn!(error = %e, "Falling back to in-memory secret store"),
        }
    }
    Box::new(MemoryStore::new())
}

#[cfg(feature = "keyring-store")]
fn keyring_store() -> Result<Box<dyn SecretStore>, StoreError> {
    Ok(Box::new(KeyringStore::try_new(STORE_NAMESPACE)?))
}

#[cfg(not(feature = "keyring-store"))]
fn keyring_store() -> Result<Box<dyn SecretStore>, StoreError> {
    Err(StoreError::Unavailable {
        message: "built without the keyring-store feature".to_string(),
    })
}
