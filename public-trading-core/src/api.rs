//! Typed paths for the brokerage endpoints.
//!
//! Payloads stay opaque (`serde_json::Value`); only the account listing is
//! parsed, far enough to pick an account id by type.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::client::{ApiClient, ApiError, ApiRequest};
use crate::config::ClientConfig;
use crate::credential::CredentialSource;
use crate::error::PublicTradingError;
use crate::store::SecretStore;
use crate::token_manager::DefaultTokenManager;

const ACCOUNTS_PATH: &str = "/userapigateway/trading/account";
const INSTRUMENTS_PATH: &str = "/userapigateway/trading/instruments";

/// Instrument reference used in market-data request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    /// `EQUITY`, `OPTION`, `CRYPTO`, ... passed through verbatim.
    #[serde(rename = "type")]
    pub instrument_type: String,
}

impl Instrument {
    /// Instrument of any type.
    pub fn new(symbol: impl Into<String>, instrument_type: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            instrument_type: instrument_type.into(),
        }
    }

    pub fn equity(symbol: impl Into<String>) -> Self {
        Self::new(symbol, "EQUITY")
    }

    pub fn option(symbol: impl Into<String>) -> Self {
        Self::new(symbol, "OPTION")
    }
}

/// The two fields of an account entry this crate reads.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub account_id: String,
    pub account_type: String,
}

#[derive(Deserialize)]
struct AccountsEnvelope {
    #[serde(default)]
    accounts: Vec<AccountSummary>,
}

/// Only plain identifier characters may be spliced into a path.
fn segment(value: &str) -> Result<&str, ApiError> {
    let ok = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(value)
    } else {
        Err(ApiError::InvalidPath {
            path: value.to_string(),
            message: "path segment must be alphanumeric, '-', '_' or '.'".to_string(),
        })
    }
}

/// Brokerage endpoints on top of an [`ApiClient`].
#[derive(Debug, Clone)]
pub struct PublicApi {
    client: ApiClient,
}

impl PublicApi {
    /// Wrap an already configured client.
    pub fn new(client: ApiClient) -> Self {
        Self { client }
    }

    /// Build a ready client from configuration.
    ///
    /// Validates `config`, resolves the trading secret through
    /// [`CredentialSource::default_chain`] against `store`, and when
    /// `persist_token` is set restores and keeps the access token in `store`.
    /// No network call is made.
    pub async fn connect(
        config: &ClientConfig,
        store: Arc<dyn SecretStore>,
    ) -> Result<Self, PublicTradingError> {
        config.validate()?;

        let secret = CredentialSource::default_chain(config)
            .resolve(Some(store.as_ref()))
            .await?;

        let mut tokens = DefaultTokenManager::from_config(config, secret)?;
        if config.persist_token {
            tokens = tokens.with_store(store, config.profile.clone());
        }
        let tokens = Arc::new(tokens);

        if tokens.load_persisted().await {
            debug!(profile = %config.profile, "Restored cached access token");
        }

        Ok(Self::new(ApiClient::from_config(config, tokens)?))
    }

    /// The underlying client, for raw calls and token access.
    pub fn client(&self) -> &ApiClient {
        &self.client
    }

    /// `GET /userapigateway/trading/account`
    pub async fn accounts(&self) -> Result<Value, ApiError> {
        self.client.get_json(ACCOUNTS_PATH).await
    }

    /// Account ids and types from the account listing.
    pub async fn account_summaries(&self) -> Result<Vec<AccountSummary>, ApiError> {
        let envelope: AccountsEnvelope = self.client.get_json(ACCOUNTS_PATH).await?;
        Ok(envelope.accounts)
    }

    /// Id of the account with the given type. When several match, the last
    /// one listed wins.
    pub async fn account_id_for_type(&self, account_type: &str) -> Result<String, ApiError> {
        self.account_summaries()
            .await?
            .into_iter()
            .filter(|account| account.account_type == account_type)
            .map(|account| account.account_id)
            .last()
            .ok_or_else(|| ApiError::AccountTypeNotFound {
                account_type: account_type.to_string(),
            })
    }

    /// `GET /userapigateway/trading/{accountId}/portfolio/v2`
    pub async fn portfolio(&self, account_id: &str) -> Result<Value, ApiError> {
        let path = format!("/userapigateway/trading/{}/portfolio/v2", segment(account_id)?);
        self.client.get_json(&path).await
    }

    /// `GET /userapigateway/trading/instruments`
    pub async fn instruments(&self) -> Result<Value, ApiError> {
        self.client.get_json(INSTRUMENTS_PATH).await
    }

    /// `POST /userapigateway/marketdata/{accountId}/quotes`
    pub async fn quotes(
        &self,
        account_id: &str,
        instruments: &[Instrument],
    ) -> Result<Value, ApiError> {
        let path = format!("/userapigateway/marketdata/{}/quotes", segment(account_id)?);
        self.client
            .post_json(&path, &json!({ "instruments": instruments }))
            .await
    }

    /// `POST /userapigateway/marketdata/{accountId}/option-expirations`
    pub async fn option_expirations(
        &self,
        account_id: &str,
        instrument: &Instrument,
    ) -> Result<Value, ApiError> {
        let path = format!(
            "/userapigateway/marketdata/{}/option-expirations",
            segment(account_id)?
        );
        self.client
            .post_json(&path, &json!({ "instrument": instrument }))
            .await
    }

    /// `POST /userapigateway/marketdata/{accountId}/option-chain`
    pub async fn option_chain(
        &self,
        account_id: &str,
        instrument: &Instrument,
        expiration_date: &str,
    ) -> Result<Value, ApiError> {
        let path = format!(
            "/userapigateway/marketdata/{}/option-chain",
            segment(account_id)?
        );
        let body = json!({ "instrument": instrument, "expirationDate": expiration_date });
        self.client.post_json(&path, &body).await
    }

    /// `GET /userapigateway/option-details/{accountId}/{osiSymbol}/greeks`
    pub async fn option_greeks(
        &self,
        account_id: &str,
        osi_symbol: &str,
    ) -> Result<Value, ApiError> {
        let path = format!(
            "/userapigateway/option-details/{}/{}/greeks",
            segment(account_id)?,
            segment(osi_symbol)?
        );
        self.client.get_json(&path).await
    }

    /// `POST /userapigateway/trading/{accountId}/preflight/single-leg`
    pub async fn preflight_single_leg(
        &self,
        account_id: &str,
        order: Value,
    ) -> Result<Value, ApiError> {
        let path = format!(
            "/userapigateway/trading/{}/preflight/single-leg",
            segment(account_id)?
        );
        self.client
            .call(ApiRequest::post(path).json_body(order))
            .await?
            .json()
    }
}
