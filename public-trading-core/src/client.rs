//! Authenticated HTTP client.
//!
//! [`ApiClient`] attaches a bearer token from a [`TokenManager`] to every
//! request and applies the retry rules:
//!
//! - connection failures, timeouts and 5xx responses are retried with
//!   exponential backoff up to the policy's cap;
//! - a 401 forces one token refresh and exactly one more attempt;
//! - everything else surfaces immediately.

use std::sync::Arc;
use std::time::Instant;

pub use reqwest::Method;

use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::error::{ServiceErrorBody, summarize_body};
use crate::retry::RetryPolicy;
use crate::token::{AuthError, Token, TokenManager};

/// Network-level failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// The request did not complete within the timeout.
    Timeout,
    /// The connection could not be established.
    Connect,
    /// The connection dropped while the request or response was in flight.
    Interrupted,
    /// Anything else (request building, redirects, ...). Not retried.
    Other,
}

impl TransportKind {
    fn from_reqwest(e: &reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect
        } else if e.is_request() || e.is_body() {
            Self::Interrupted
        } else {
            Self::Other
        }
    }

    /// Timeouts, connect failures and dropped connections are worth retrying.
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Connect => "connect",
            Self::Interrupted => "interrupted",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// The token could not be obtained.
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        message: String,
        service_error: Option<ServiceErrorBody>,
    },

    #[error("invalid request path {path}: {message}")]
    InvalidPath { path: String, message: String },

    #[error("failed to decode response: {message}")]
    Decode { message: String },

    #[error("no account of type {account_type}")]
    AccountTypeNotFound { account_type: String },
}

impl ApiError {
    /// HTTP status for `Http` errors and rejected token exchanges.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Auth(e) => e.status(),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            Self::Transport { kind, .. } => kind.is_transient(),
            Self::Http { status, .. } => (500..=599).contains(status),
            _ => false,
        }
    }
}

/// An outbound request. Payloads are passed through untouched.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    /// A request with no query or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// `GET path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST path`; add a body with [`json_body`](Self::json_body).
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    /// Append a query parameter. Repeated keys are kept.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Send `body` as JSON.
    pub fn json_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `body` as the JSON payload.
    pub fn with_body<B: Serialize>(self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| ApiError::Decode {
            message: format!("failed to encode request body: {}", e),
        })?;
        Ok(self.json_body(value))
    }
}

/// A successful (2xx) response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl ApiResponse {
    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        if self.body.is_empty() {
            return serde_json::from_value(serde_json::Value::Null).map_err(|e| ApiError::Decode {
                message: e.to_string(),
            });
        }
        serde_json::from_slice(&self.body).map_err(|e| ApiError::Decode {
            message: e.to_string(),
        })
    }

    /// Body as text, with invalid UTF-8 replaced.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Issues authenticated calls against one API host.
///
/// Clone is cheap: the HTTP connection pool and the token manager are shared.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    tokens: Arc<dyn TokenManager>,
    retry: RetryPolicy,
}

impl ApiClient {
    /// Client for `base_url` with a per-request `timeout`.
    pub fn new(
        base_url: Url,
        tokens: Arc<dyn TokenManager>,
        retry: RetryPolicy,
        timeout: std::time::Duration,
    ) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport {
                kind: TransportKind::Other,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url,
            tokens,
            retry,
        })
    }

    /// Client using the configured host, retry policy and timeout.
    pub fn from_config(
        config: &ClientConfig,
        tokens: Arc<dyn TokenManager>,
    ) -> Result<Self, ApiError> {
        Self::new(
            config.base_url.clone(),
            tokens,
            config.retry_policy(),
            config.request_timeout(),
        )
    }

    /// Host every request path is joined onto.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Token manager shared by all clones of this client.
    pub fn token_manager(&self) -> &Arc<dyn TokenManager> {
        &self.tokens
    }

    /// Issue `request`, retrying per the rules in the module docs.
    pub async fn call(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.url_for(&request.path)?;
        let mut token = self.tokens.get_valid_token().await?;
        let mut retries = 0u32;
        let mut refreshed = false;

        loop {
            let started = Instant::now();
            let result = self.send_once(&url, &request, &token).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let err = match result {
                Ok(response) => {
                    debug!(
                        method = %request.method,
                        path = %request.path,
                        status = response.status,
                        retries,
                        elapsed_ms,
                        "API call succeeded"
                    );
                    return Ok(response);
                }
                Err(err) => err,
            };

            let unauthorized = matches!(
                err,
                ApiError::Http { status, .. } if status == StatusCode::UNAUTHORIZED.as_u16()
            );
            if unauthorized && !refreshed {
                info!(method = %request.method, path = %request.path, "Got 401, refreshing token");
                token = self.tokens.refresh_after(&token).await?;
                refreshed = true;
                continue;
            }

            if err.is_transient() && self.retry.allows_retry(retries) {
                retries += 1;
                let delay = self.retry.backoff_for(retries);
                warn!(
                    method = %request.method,
                    path = %request.path,
                    retry = retries,
                    backoff_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                // The token may have aged past its margin while we slept.
                token = self.tokens.get_valid_token().await?;
                continue;
            }

            warn!(
                method = %request.method,
                path = %request.path,
                retries,
                elapsed_ms,
                error = %err,
                "API call failed"
            );
            return Err(err);
        }
    }

    /// GET `path` and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(ApiRequest::get(path)).await?.json()
    }

    /// POST `body` to `path` and decode the JSON body.
    pub async fn post_json<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let request = ApiRequest::post(path).with_body(&body)?;
        self.call(request).await?.json()
    }

    /// A leading `/` replaces any path on the base URL.
    fn url_for(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url.join(path).map_err(|e| ApiError::InvalidPath {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// One attempt. Non-2xx statuses become [`ApiError::Http`].
    async fn send_once(
        &self,
        url: &Url,
        request: &ApiRequest,
        token: &Token,
    ) -> Result<ApiResponse, ApiError> {
        let mut builder = self
            .http
            .request(request.method.clone(), url.clone())
            .header(AUTHORIZATION, token.bearer_header())
            .header(ACCEPT, "*/*");

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.bytes().await.map_err(transport_error)?;

        if status.is_success() {
            return Ok(ApiResponse {
                status: status.as_u16(),
                body: body.to_vec(),
            });
        }

        let text = String::from_utf8_lossy(&body);
        Err(ApiError::Http {
            status: status.as_u16(),
            message: summarize_body(&text),
            service_error: ServiceErrorBody::parse(&text),
        })
    }
}

fn transport_error(e: reqwest::Error) -> ApiError {
    ApiError::Transport {
        kind: TransportKind::from_reqwest(&e),
        message: e.to_string(),
    }
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url.as_str())
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
