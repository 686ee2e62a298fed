//! Client configuration.
//!
//! Every field has a default so a config file only needs the values it
//! changes. File discovery and TOML parsing live in the CLI.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_BACKOFF_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_MAX_RETRIES, RetryPolicy,
};

/// Production API host.
pub const DEFAULT_BASE_URL: &str = "https://api.public.com";

/// Environment variable consulted first for the trading secret.
pub const DEFAULT_SECRET_ENV_VAR: &str = "PUBLIC_TRADING_SECRET";

/// Validity requested from the secret exchange, in minutes.
pub const DEFAULT_TOKEN_VALIDITY_MINUTES: u32 = 60;

/// Tokens are treated as expired this many seconds early.
pub const DEFAULT_SAFETY_MARGIN_SECS: u64 = 60;

/// Per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        message: message.into(),
    }
}

/// Retry knobs as they appear in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy::new(
            settings.max_retries,
            Duration::from_millis(settings.initial_backoff_ms),
        )
        .with_max_backoff(Duration::from_millis(settings.max_backoff_ms))
        .with_multiplier(settings.multiplier)
    }
}

/// Symbols the CLI falls back to when none are given.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Watchlist {
    pub stocks: Vec<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// API host; every endpoint path is joined onto it.
    pub base_url: Url,

    /// Name used to namespace stored secrets and cached tokens.
    pub profile: String,

    /// Account type selected when no account id is given.
    pub account_type: String,

    pub token_validity_minutes: u32,
    pub safety_margin_secs: u64,
    pub request_timeout_secs: u64,

    /// Environment variable holding the trading secret.
    pub secret_env_var: String,

    /// Keep exchanged tokens in the secret store between runs.
    pub persist_token: bool,

    pub retry: RetrySettings,
    pub watchlist: Watchlist,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            profile: "default".to_string(),
            account_type: "BROKERAGE".to_string(),
            token_validity_minutes: DEFAULT_TOKEN_VALIDITY_MINUTES,
            safety_margin_secs: DEFAULT_SAFETY_MARGIN_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            secret_env_var: DEFAULT_SECRET_ENV_VAR.to_string(),
            persist_token: true,
            retry: RetrySettings::default(),
            watchlist: Watchlist::default(),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at another host (staging or a mock server).
    pub fn with_base_url(base_url: Url) -> Self {
        Self {
            base_url,
            ..Self::default()
        }
    }

    /// Per-request timeout, shared by API calls and the token exchange.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// `safety_margin_secs` as a signed duration, or `None` when it does not
    /// fit one.
    pub fn checked_safety_margin(&self) -> Option<chrono::Duration> {
        i64::try_from(self.safety_margin_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
    }

    /// Safety margin applied to cached tokens.
    ///
    /// An out-of-range value saturates to the largest duration, which makes
    /// every token unusable rather than usable past expiry; [`validate`]
    /// rejects such configs up front.
    ///
    /// [`validate`]: ClientConfig::validate
    pub fn safety_margin(&self) -> chrono::Duration {
        self.checked_safety_margin().unwrap_or(chrono::Duration::MAX)
    }

    /// Validity requested from the secret exchange.
    pub fn token_validity(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.token_validity_minutes))
    }

    /// Retry policy built from the `[retry]` table.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.retry)
    }

    /// Reject settings that would make every token unusable or every
    /// request fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.base_url.scheme() {
            "http" | "https" => {}
            other => return Err(invalid(format!("base_url scheme must be http(s), got {}", other))),
        }
        if self.base_url.cannot_be_a_base() {
            return Err(invalid("base_url cannot be used as a base"));
        }
        if self.profile.trim().is_empty() {
            return Err(invalid("profile must not be empty"));
        }
        if self.token_validity_minutes == 0 {
            return Err(invalid("token_validity_minutes must be positive"));
        }
        let margin = self.checked_safety_margin().ok_or_else(|| {
            invalid(format!(
                "safety_margin_secs ({}) is out of range",
                self.safety_margin_secs
            ))
        })?;
        if margin >= self.token_validity() {
            return Err(invalid(format!(
                "safety_margin_secs ({}) must be shorter than the token validity ({} min)",
                self.safety_margin_secs, self.token_validity_minutes
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(invalid("request_timeout_secs must be positive"));
        }
        if self.retry.initial_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid("retry.initial_backoff_ms exceeds retry.max_backoff_ms"));
        }
        Ok(())
    }
}
