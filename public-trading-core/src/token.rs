//! Bearer tokens and the token lifecycle contract.
//!
//! This module provides:
//! - [`Token`] - A short-lived bearer token with its issue time and validity window
//! - [`AuthError`] - Failures of the secret-exchange call
//! - [`TokenManager`] - Trait for handing out valid tokens

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

use crate::store::Secret;

/// Error type for the secret-exchange call.
///
/// Cloneable so that a single failed refresh can be handed to every caller
/// that was waiting on it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// The exchange request never produced a response.
    #[error("network error during token exchange: {message}")]
    Network { message: String },

    /// The auth service answered with a non-2xx status.
    #[error("token exchange rejected with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The auth service answered 2xx but the payload had no usable token.
    #[error("malformed token exchange response: {message}")]
    MalformedResponse { message: String },

    /// The auth endpoint could not be built from the configured base URL.
    #[error("invalid auth endpoint: {message}")]
    InvalidUrl { message: String },
}

impl AuthError {
    /// HTTP status of a rejected exchange, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// A bearer token issued by the secret exchange.
///
/// Tokens are replaced, never mutated: a refresh produces a new `Token`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    value: Secret,
    issued_at: DateTime<Utc>,
    validity: Duration,
}

impl Token {
    /// A token with `value`, obtained at `issued_at` and valid for `validity`.
    pub fn new(value: impl Into<String>, issued_at: DateTime<Utc>, validity: Duration) -> Self {
        Self {
            value: Secret::new(value),
            issued_at,
            validity,
        }
    }

    /// The raw token value. Never log it.
    pub fn value(&self) -> &Secret {
        &self.value
    }

    /// When the exchange that produced this token started.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    /// Lifetime granted by the exchange.
    pub fn validity(&self) -> Duration {
        self.validity
    }

    /// `issued_at + validity`, saturating at the latest representable time.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.issued_at
            .checked_add_signed(self.validity)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether the token may still be attached to a request at `now`.
    ///
    /// A token is unusable once `now >= expires_at - safety_margin`.
    /// A negative margin counts as zero. A margin reaching past the start of
    /// representable time makes the token unusable.
    pub fn is_usable_at(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        self.expires_at()
            .checked_sub_signed(safety_margin.max(Duration::zero()))
            .is_some_and(|deadline| now < deadline)
    }

    /// Time left before expiry, clamped at zero.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at() - now).max(Duration::zero())
    }

    /// Value for the `Authorization` header.
    pub fn bearer_header(&self) -> String {
        format!("Bearer {}", self.value.expose())
    }

    /// Whether two tokens carry the same bearer value.
    pub fn same_value(&self, other: &Token) -> bool {
        self.value == other.value
    }
}

/// Hands out tokens that are safe to attach to a request.
///
/// Implementations own the cached token; callers receive clones.
#[async_trait]
pub trait TokenManager: Send + Sync {
    /// Return the cached token if still usable, otherwise exchange the
    /// credential for a new one.
    ///
    /// Concurrent callers share a single in-flight exchange.
    async fn get_valid_token(&self) -> Result<Token, AuthError>;

    /// Force a refresh because `stale` was rejected by the API.
    ///
    /// If another caller already replaced `stale`, the newer token is
    /// returned without a second exchange.
    async fn refresh_after(&self, stale: &Token) -> Result<Token, AuthError>;

    /// Peek at the cached token without refreshing.
    fn cached_token(&self) -> Option<Token>;

    /// Drop the cached token so the next request performs an exchange.
    async fn invalidate(&self);
}
