//! Default implementation of the [`TokenManager`] trait.
//!
//! [`DefaultTokenManager`] exchanges the trading secret for a personal access
//! token at `POST /userapiauthservice/personal/access-tokens` and caches it
//! until it comes within the safety margin of expiry.
//!
//! # Features
//!
//! - Cheap reads: a usable cached token costs one shared read lock
//! - Single-flight refresh: concurrent callers share one exchange, success or failure
//! - Optional persistence of the token through a [`SecretStore`]
//! - Injectable [`Clock`] for deterministic expiry tests
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use public_trading_core::{DefaultTokenManager, Secret, TokenManager};
//! use url::Url;
//!
//! let base = Url::parse("https://api.public.com")?;
//! let manager = DefaultTokenManager::new(&base, Secret::new("my-secret"))?;
//!
//! let token = manager.get_valid_token().await?;
//! println!("token expires at {}", token.expires_at());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::clock::{Clock, SystemClock};
use crate::config::ClientConfig;
use crate::error::summarize_body;
use crate::store::{Secret, SecretStore, secret_key};
use crate::token::{AuthError, Token, TokenManager};

/// Path of the secret-exchange endpoint.
pub const ACCESS_TOKEN_PATH: &str = "/userapiauthservice/personal/access-tokens";

const ACCESS_TOKEN_ENTRY: &str = "access_token";
const ISSUED_AT_ENTRY: &str = "token_issued_at";
const VALIDITY_ENTRY: &str = "token_validity_secs";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    validity_in_minutes: u32,
    secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    access_token: String,
}

struct Persistence {
    store: Arc<dyn SecretStore>,
    profile: String,
}

impl Persistence {
    fn key(&self, entry: &str) -> String {
        secret_key(&self.profile, entry)
    }
}

/// Exchanges the trading secret for bearer tokens and caches the result.
pub struct DefaultTokenManager {
    http: reqwest::Client,
    exchange_url: Url,
    secret: Secret,
    validity_minutes: u32,
    safety_margin: Duration,
    clock: Arc<dyn Clock>,
    cached: RwLock<Option<Token>>,
    /// Serializes exchanges; held for the duration of one.
    gate: tokio::sync::Mutex<()>,
    /// Completed exchanges, successful or not.
    flights: AtomicU64,
    last_outcome: Mutex<Option<Result<Token, AuthError>>>,
    persistence: Option<Persistence>,
}

impl DefaultTokenManager {
    /// Create a manager against `base_url` with default validity (60 min)
    /// and safety margin (60 s).
    pub fn new(base_url: &Url, secret: Secret) -> Result<Self, AuthError> {
        Self::from_config(&ClientConfig::with_base_url(base_url.clone()), secret)
    }

    /// Create a manager from client configuration.
    ///
    /// The exchange shares the configured request timeout.
    pub fn from_config(config: &ClientConfig, secret: Secret) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| AuthError::Network {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        let exchange_url =
            config
                .base_url
                .join(ACCESS_TOKEN_PATH)
                .map_err(|e| AuthError::InvalidUrl {
                    message: format!("{}{}: {}", config.base_url, ACCESS_TOKEN_PATH, e),
                })?;

        Ok(Self {
            http,
            exchange_url,
            secret,
            validity_minutes: config.token_validity_minutes,
            safety_margin: config.safety_margin(),
            clock: Arc::new(SystemClock),
            cached: RwLock::new(None),
            gate: tokio::sync::Mutex::new(()),
            flights: AtomicU64::new(0),
            last_outcome: Mutex::new(None),
            persistence: None,
        })
    }

    /// Replace the HTTP client, e.g. to share a connection pool.
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    /// Use `clock` for issue times and expiry checks.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validity to request from the exchange.
    pub fn with_validity_minutes(mut self, minutes: u32) -> Self {
        self.validity_minutes = minutes;
        self
    }

    /// Treat cached tokens as expired `margin` before their expiry.
    pub fn with_safety_margin(mut self, margin: Duration) -> Self {
        self.safety_margin = margin;
        self
    }

    /// Persist exchanged tokens under `public-trading/{profile}/...`.
    pub fn with_store(mut self, store: Arc<dyn SecretStore>, profile: impl Into<String>) -> Self {
        self.persistence = Some(Persistence {
            store,
            profile: profile.into(),
        });
        self
    }

    /// Number of completed secret exchanges.
    pub fn exchange_count(&self) -> u64 {
        self.flights.load(Ordering::Acquire)
    }

    /// Load a previously persisted token into the cache.
    ///
    /// Returns `true` if a still-usable token was restored. Store errors are
    /// logged and treated as "nothing persisted".
    pub async fn load_persisted(&self) -> bool {
        let Some(persistence) = &self.persistence else {
            return false;
        };

        let token = match read_persisted(persistence).await {
            Ok(Some(token)) => token,
            Ok(None) => return false,
            Err(message) => {
                warn!(profile = %persistence.profile, "Ignoring persisted token: {}", message);
                return false;
            }
        };

        if !token.is_usable_at(self.clock.now(), self.safety_margin) {
            debug!(expires_at = %token.expires_at(), "Persisted token is past its safety margin");
            return false;
        }

        info!(expires_at = %token.expires_at(), "Restored persisted access token");
        *self.cached.write() = Some(token);
        true
    }

    fn usable_cached(&self) -> Option<Token> {
        let now = self.clock.now();
        self.cached
            .read()
            .as_ref()
            .filter(|token| token.is_usable_at(now, self.safety_margin))
            .cloned()
    }

    /// Run or join a refresh.
    ///
    /// `seen` is the flight counter observed before queueing on the gate; if
    /// it moved while we waited, the exchange we were waiting on is shared.
    async fn refresh(&self, seen: u64, stale: Option<&Token>) -> Result<Token, AuthError> {
        let _guard = self.gate.lock().await;

        if self.flights.load(Ordering::Acquire) != seen {
            if let Some(outcome) = self.last_outcome.lock().clone() {
                debug!("Sharing result of in-flight token exchange");
                return outcome;
            }
        }

        // Another caller may have finished an exchange before `seen` was read.
        if let Some(token) = self.usable_cached() {
            if stale.is_none_or(|stale| !token.same_value(stale)) {
                return Ok(token);
            }
        }

        let outcome = self.exchange().await;
        match &outcome {
            Ok(token) => {
                *self.cached.write() = Some(token.clone());
                info!(expires_at = %token.expires_at(), "Obtained new access token");
                self.persist(token).await;
            }
            Err(e) => {
                *self.cached.write() = None;
                warn!(error = %e, "Token exchange failed");
            }
        }

        *self.last_outcome.lock() = Some(outcome.clone());
        self.flights.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn exchange(&self) -> Result<Token, AuthError> {
        let issued_at = self.clock.now();
        let payload = ExchangeRequest {
            validity_in_minutes: self.validity_minutes,
            secret: self.secret.expose(),
        };

        debug!(validity_minutes = self.validity_minutes, "Requesting personal access token");

        let response = self
            .http
            .post(self.exchange_url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|e| AuthError::Network {
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                message: summarize_body(&body),
            });
        }

        let body: ExchangeResponse =
            response
                .json()
                .await
                .map_err(|e| AuthError::MalformedResponse {
                    message: e.to_string(),
                })?;

        if body.access_token.trim().is_empty() {
            return Err(AuthError::MalformedResponse {
                message: "accessToken is empty".to_string(),
            });
        }

        Ok(Token::new(
            body.access_token,
            issued_at,
            Duration::minutes(i64::from(self.validity_minutes)),
        ))
    }

    async fn persist(&self, token: &Token) {
        let Some(persistence) = &self.persistence else {
            return;
        };

        let entries = [
            (ACCESS_TOKEN_ENTRY, token.value().clone()),
            (ISSUED_AT_ENTRY, Secret::new(token.issued_at().to_rfc3339())),
            (
                VALIDITY_ENTRY,
                Secret::new(token.validity().num_seconds().to_string()),
            ),
        ];

        for (entry, value) in &entries {
            if let Err(e) = persistence.store.set(&persistence.key(entry), value).await {
                warn!(entry = *entry, error = %e, "Failed to persist access token");
                return;
            }
        }
        debug!(profile = %persistence.profile, "Persisted access token");
    }

    async fn forget_persisted(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        for entry in [ACCESS_TOKEN_ENTRY, ISSUED_AT_ENTRY, VALIDITY_ENTRY] {
            if let Err(e) = persistence.store.delete(&persistence.key(entry)).await {
                warn!(entry, error = %e, "Failed to delete persisted token entry");
            }
        }
    }
}

async fn read_persisted(persistence: &Persistence) -> Result<Option<Token>, String> {
    let get = |entry: &'static str| {
        let key = persistence.key(entry);
        async move { persistence.store.get(&key).await.map_err(|e| e.to_string()) }
    };

    let (Some(value), Some(issued_at), Some(validity)) = (
        get(ACCESS_TOKEN_ENTRY).await?,
        get(ISSUED_AT_ENTRY).await?,
        get(VALIDITY_ENTRY).await?,
    ) else {
        return Ok(None);
    };

    let issued_at = DateTime::parse_from_rfc3339(issued_at.expose())
        .map_err(|e| format!("bad issue time: {}", e))?
        .with_timezone(&Utc);
    let validity_secs: i64 = validity
        .expose()
        .parse()
        .map_err(|e| format!("bad validity: {}", e))?;
    let validity = Duration::try_seconds(validity_secs)
        .filter(|validity| *validity > Duration::zero())
        .ok_or_else(|| format!("validity out of range: {}s", validity_secs))?;
    if issued_at.checked_add_signed(validity).is_none() {
        return Err(format!("expiry overflows: {} + {}s", issued_at, validity_secs));
    }

    Ok(Some(Token::new(value.expose(), issued_at, validity)))
}

impl std::fmt::Debug for DefaultTokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultTokenManager")
            .field("exchange_url", &self.exchange_url.as_str())
            .field("validity_minutes", &self.validity_minutes)
            .field("safety_margin", &self.safety_margin)
            .field("has_token", &self.cached.read().is_some())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenManager for DefaultTokenManager {
    async fn get_valid_token(&self) -> Result<Token, AuthError> {
        if let Some(token) = self.usable_cached() {
            debug!("Using cached access token");
            return Ok(token);
        }

        let seen = self.flights.load(Ordering::Acquire);
        self.refresh(seen, None).await
    }

    async fn refresh_after(&self, stale: &Token) -> Result<Token, AuthError> {
        info!("Access token rejected, forcing refresh");
        let seen = self.flights.load(Ordering::Acquire);
        self.refresh(seen, Some(stale)).await
    }

    fn cached_token(&self) -> Option<Token> {
        self.cached.read().clone()
    }

    async fn invalidate(&self) {
        let _guard = self.gate.lock().await;
        *self.cached.write() = None;
        *self.last_outcome.lock() = None;
        self.forget_persisted().await;
        info!("Invalidated cached access token");
    }
}
