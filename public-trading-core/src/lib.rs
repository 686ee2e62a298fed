//! # Public Trading Core
//!
//! Credential-scoped client for the Public brokerage REST API.
//!
//! This crate provides:
//! - [`DefaultTokenManager`] - exchanges the trading secret for short-lived
//!   bearer tokens, caches them and refreshes them single-flight
//! - [`ApiClient`] - authenticated calls with timeout, backoff and 401 recovery
//! - [`PublicApi`] - typed endpoint paths returning opaque JSON
//! - Secret storage ([`MemoryStore`], OS keyring) and credential lookup
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use public_trading_core::{
//!     ApiClient, ClientConfig, CredentialSource, DefaultTokenManager, PublicApi,
//! };
//!
//! let config = ClientConfig::default();
//! let secret = CredentialSource::default_chain(&config).resolve(None).await?;
//! let tokens = Arc::new(DefaultTokenManager::from_config(&config, secret)?);
//! let api = PublicApi::new(ApiClient::from_config(&config, tokens)?);
//!
//! let accounts = api.accounts().await?;
//! ```

pub mod api;
pub mod client;
pub mod clock;
pub mod config;
pub mod credential;
pub mod error;
pub mod retry;
pub mod store;
pub mod token;
pub mod token_manager;

// Re-export commonly used types at crate root
pub use api::{AccountSummary, Instrument, PublicApi};

pub use client::{ApiClient, ApiError, ApiRequest, ApiResponse, Method, TransportKind};

pub use clock::{Clock, ManualClock, SystemClock};

pub use config::{ClientConfig, ConfigError, RetrySettings, Watchlist};

pub use credential::{CredentialError, CredentialSource};

pub use error::{PublicTradingError, ServiceErrorBody};

pub use retry::RetryPolicy;

pub use store::{MemoryStore, Secret, SecretStore, StoreError, create_store};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use token::{AuthError, Token, TokenManager};

pub use token_manager::DefaultTokenManager;
