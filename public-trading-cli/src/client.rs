//! Wiring from configuration to a ready [`PublicApi`].

use anyhow::{Context, Result};
use public_trading_core::{
    ClientConfig, PublicApi, PublicTradingError, SecretStore, TokenManager, create_store,
};
use std::sync::Arc;
use tracing::info;

/// Everything a command needs to talk to the API.
pub struct Session {
    pub api: PublicApi,
    config: ClientConfig,
}

impl Session {
    /// Resolve the secret, restore any cached token and build the client.
    pub async fn open(config: ClientConfig) -> Result<Self> {
        let store: Arc<dyn SecretStore> = Arc::from(create_store(true));

        let api = match PublicApi::connect(&config, store).await {
            Ok(api) => api,
            Err(e @ PublicTradingError::Credential(_)) => {
                return Err(e).with_context(|| {
                    format!(
                        "Set {} or run `public-trading set-secret`",
                        config.secret_env_var
                    )
                });
            }
            Err(e) => return Err(e).context("Failed to create API client"),
        };

        Ok(Self { api, config })
    }

    /// Token manager shared with the API client.
    pub fn tokens(&self) -> &Arc<dyn TokenManager> {
        self.api.client().token_manager()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Explicit id if given, else the account matching `account_type`
    /// (falling back to the configured type).
    pub async fn resolve_account(
        &self,
        account_id: Option<&str>,
        account_type: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = account_id {
            return Ok(id.to_string());
        }

        let account_type = account_type.unwrap_or(&self.config.account_type);
        let id = self
            .api
            .account_id_for_type(account_type)
            .await
            .with_context(|| format!("Failed to find a {} account", account_type))?;
        info!(account_type, account_id = %id, "Selected account");
        Ok(id)
    }
}

/// Split `key=value` query arguments.
pub fn parse_query_pairs(pairs: &[String]) -> Result<Vec<(String, String)>> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("Query parameter {:?} is not key=value", pair))
        })
        .collect()
}
