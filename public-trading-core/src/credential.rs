//! Locating the trading secret.
//!
//! The secret is read once at startup from the first [`CredentialSource`]
//! that has it, then handed to the token manager for the rest of the process.

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::store::{Secret, SecretStore, secret_key};

/// Store entry holding the trading secret for a profile.
pub const SECRET_ENTRY: &str = "secret";

#[derive(Debug, Error)]
pub enum CredentialError {
    /// No source produced a non-empty secret.
    #[error("no trading secret found (tried: {tried})")]
    NotFound { tried: String },
}

/// Where to look for the trading secret.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    /// A value supplied directly, e.g. from stdin.
    Value(Secret),

    /// An environment variable.
    Env { var: String },

    /// An entry in the secret store.
    Store { key: String },

    /// Try each source in order until one succeeds.
    Chain(Vec<CredentialSource>),
}

impl CredentialSource {
    /// Read the environment variable `var`.
    pub fn env(var: impl Into<String>) -> Self {
        Self::Env { var: var.into() }
    }

    /// Read `key` from the secret store.
    pub fn store(key: impl Into<String>) -> Self {
        Self::Store { key: key.into() }
    }

    /// Environment variable first, then the profile's store entry.
    pub fn default_chain(config: &ClientConfig) -> Self {
        Self::Chain(vec![
            Self::env(config.secret_env_var.clone()),
            Self::store(secret_key(&config.profile, SECRET_ENTRY)),
        ])
    }

    /// Short description safe to log.
    pub fn describe(&self) -> String {
        match self {
            Self::Value(_) => "inline value".to_string(),
            Self::Env { var } => format!("env:{}", var),
            Self::Store { key } => format!("store:{}", key),
            Self::Chain(sources) => sources
                .iter()
                .map(Self::describe)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    fn flatten<'a>(&'a self, out: &mut Vec<&'a CredentialSource>) {
        match self {
            Self::Chain(sources) => sources.iter().for_each(|s| s.flatten(out)),
            leaf => out.push(leaf),
        }
    }

    /// Resolve the secret. `store` is consulted only by `Store` sources;
    /// without one they are skipped.
    pub async fn resolve(
        &self,
        store: Option<&dyn SecretStore>,
    ) -> Result<Secret, CredentialError> {
        let mut leaves = Vec::new();
        self.flatten(&mut leaves);

        for source in leaves {
            let found = match source {
                Self::Value(secret) => Some(secret.clone()),
                Self::Env { var } => std::env::var(var).ok().map(Secret::new),
                Self::Store { key } => match store {
                    Some(store) => match store.get(key).await {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(
                                source = %source.describe(),
                                error = %e,
                                "Secret store lookup failed"
                            );
                            None
                        }
                    },
                    None => None,
                },
                Self::Chain(_) => None,
            };

            match found {
                Some(secret) if !secret.is_blank() => {
                    debug!(source = %source.describe(), "Found trading secret");
                    return Ok(secret);
                }
                Some(_) => debug!(source = %source.describe(), "Ignoring blank trading secret"),
                None => debug!(source = %source.describe(), "No trading secret"),
            }
        }

        Err(CredentialError::NotFound {
            tried: self.describe(),
        })
    }
}
