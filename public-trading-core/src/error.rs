//! Top-level error types.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::client::ApiError;
use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::store::StoreError;
use crate::token::AuthError;

/// Maximum length for response bodies quoted in error messages.
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Top-level error type encompassing every library error.
#[derive(Debug, Error)]
pub enum PublicTradingError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Error payload the API returns alongside non-2xx statuses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceErrorBody {
    pub error: String,
    pub message: String,
}

impl ServiceErrorBody {
    /// Parse a `{"error": ..., "message": ...}` body, if that is what it is.
    pub fn parse(body: &str) -> Option<Self> {
        serde_json::from_str(body).ok()
    }
}

impl std::fmt::Display for ServiceErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Human-readable summary of an error body: the service error if it parses,
/// otherwise the raw text truncated to a loggable size.
pub(crate) fn summarize_body(body: &str) -> String {
    if let Some(parsed) = ServiceErrorBody::parse(body) {
        return parsed.to_string();
    }
    if body.len() <= MAX_ERROR_BODY_LENGTH {
        return body.to_string();
    }
    let mut cut = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..cut], body.len())
}
