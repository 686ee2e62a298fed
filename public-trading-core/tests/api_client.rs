//! Integration tests for ApiClient retry rules and the endpoint helpers.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use public_trading_core::{
    ApiClient, ApiError, ApiRequest, AuthError, ClientConfig, DefaultTokenManager, Instrument,
    MemoryStore, PublicApi, PublicTradingError, RetryPolicy, Secret, SecretStore, TransportKind,
};
use serde_json::json;
use tokio::task::JoinSet;
use url::Url;
use wiremock::{
    Mock, MockServer, Request, Respond, ResponseTemplate,
    matchers::{body_json, header, method, path, query_param},
};

const EXCHANGE_PATH: &str = "/userapiauthservice/personal/access-tokens";
const ACCOUNTS_PATH: &str = "/userapigateway/trading/account";

/// Hands out `tok-1`, `tok-2`, ... on successive exchanges.
struct TokenSequence(AtomicUsize);

impl Respond for TokenSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_json(json!({ "accessToken": format!("tok-{}", n) }))
    }
}

/// Replays `statuses` in order, then keeps answering 200.
struct StatusSequence {
    statuses: Vec<u16>,
    calls: AtomicUsize,
}

impl Respond for StatusSequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match self.statuses.get(n) {
            Some(status) => ResponseTemplate::new(*status),
            None => ResponseTemplate::new(200).set_body_json(json!({ "ok": true })),
        }
    }
}

async fn mount_exchange(server: &MockServer, expected: u64) {
    Mock::given(method("POST"))
        .and(path(EXCHANGE_PATH))
        .respond_with(TokenSequence(AtomicUsize::new(0)))
        .expect(expected)
        .mount(server)
        .await;
}

fn client_for(server: &MockServer, retry: RetryPolicy, timeout: Duration) -> ApiClient {
    let base = Url::parse(&server.uri()).unwrap();
    let config = ClientConfig::with_base_url(base.clone());
    let tokens = DefaultTokenManager::from_config(&config, Secret::new("test-secret")).unwrap();
    ApiClient::new(base, Arc::new(tokens), retry, timeout).unwrap()
}

fn fast_retry(max_retries: u32) -> RetryPolicy {
    RetryPolicy::new(max_retries, Duration::from_millis(10))
}

#[tokio::test]
async fn test_bearer_token_is_attached() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accounts": [] })))
        .expect(2)
        .mount(&server)
        .await;

    let api = PublicApi::new(client_for(&server, fast_retry(3), Duration::from_secs(5)));

    assert_eq!(api.accounts().await.unwrap(), json!({ "accounts": [] }));
    // Second call reuses the cached token.
    api.accounts().await.unwrap();
}

#[tokio::test]
async fn test_401_refreshes_once_and_retries_once() {
    let server = MockServer::start().await;
    mount_exchange(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accounts": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3), Duration::from_secs(5));
    let response = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap();

    assert_eq!(response.status, 200);
}

#[tokio::test]
async fn test_repeated_401_surfaces_after_single_retry() {
    let server = MockServer::start().await;
    mount_exchange(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "UNAUTHORIZED",
            "message": "token rejected"
        })))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3), Duration::from_secs(5));
    let err = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

    match err {
        ApiError::Http {
            status,
            service_error,
            ..
        } => {
            assert_eq!(status, 401);
            assert_eq!(service_error.unwrap().error, "UNAUTHORIZED");
        }
        other => panic!("expected HTTP 401, got {:?}", other),
    }
}

#[tokio::test]
async fn test_503_retried_up_to_cap_with_backoff() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3), Duration::from_secs(5));
    let started = Instant::now();
    let err = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

    assert_eq!(err.status(), Some(503));
    // 10ms + 20ms + 40ms of backoff.
    assert!(started.elapsed() >= Duration::from_millis(70));
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(StatusSequence {
            statuses: vec![502, 500],
            calls: AtomicUsize::new(0),
        })
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3), Duration::from_secs(5));
    let response = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap();

    assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({ "ok": true }));
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/userapigateway/trading/A1/portfolio/v2"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such account"))
        .expect(1)
        .mount(&server)
        .await;

    let api = PublicApi::new(client_for(&server, fast_retry(3), Duration::from_secs(5)));
    let err = api.portfolio("A1").await.unwrap_err();

    match err {
        ApiError::Http {
            status, message, ..
        } => {
            assert_eq!(status, 404);
            assert_eq!(message, "no such account");
        }
        other => panic!("expected HTTP 404, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_is_retried_then_surfaces() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .expect(2)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(1), Duration::from_millis(100));
    let err = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::Transport {
            kind: TransportKind::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_auth_failure_propagates_without_calling_api() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EXCHANGE_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(3), Duration::from_secs(5));
    let err = client.call(ApiRequest::get(ACCOUNTS_PATH)).await.unwrap_err();

    assert!(matches!(
        err,
        ApiError::Auth(AuthError::Rejected { status: 500, .. })
    ));
    assert!(client.token_manager().cached_token().is_none());
}

#[tokio::test]
async fn test_account_id_for_type_picks_last_match() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accounts": [
                { "accountId": "B1", "accountType": "BROKERAGE" },
                { "accountId": "R1", "accountType": "ROTH_IRA" },
                { "accountId": "B2", "accountType": "BROKERAGE" }
            ]
        })))
        .mount(&server)
        .await;

    let api = PublicApi::new(client_for(&server, fast_retry(0), Duration::from_secs(5)));

    assert_eq!(api.account_id_for_type("BROKERAGE").await.unwrap(), "B2");
    assert!(matches!(
        api.account_id_for_type("TREASURY").await,
        Err(ApiError::AccountTypeNotFound { .. })
    ));
}

#[tokio::test]
async fn test_quotes_posts_instruments() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/userapigateway/marketdata/A1/quotes"))
        .and(body_json(json!({
            "instruments": [
                { "symbol": "AAPL", "type": "EQUITY" },
                { "symbol": "LMND251219P00060000", "type": "OPTION" }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "quotes": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let api = PublicApi::new(client_for(&server, fast_retry(0), Duration::from_secs(5)));
    let quotes = api
        .quotes(
            "A1",
            &[
                Instrument::equity("AAPL"),
                Instrument::option("LMND251219P00060000"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(quotes, json!({ "quotes": [] }));
}

#[tokio::test]
async fn test_option_chain_and_greeks_paths() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/userapigateway/marketdata/A1/option-chain"))
        .and(body_json(json!({
            "instrument": { "symbol": "LMND", "type": "EQUITY" },
            "expirationDate": "2025-12-19"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "calls": [], "puts": [] })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/userapigateway/option-details/A1/LMND251219P00060000/greeks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "delta": "-0.41" })))
        .expect(1)
        .mount(&server)
        .await;

    let api = PublicApi::new(client_for(&server, fast_retry(0), Duration::from_secs(5)));

    let chain = api
        .option_chain("A1", &Instrument::equity("LMND"), "2025-12-19")
        .await
        .unwrap();
    assert_eq!(chain["puts"], json!([]));

    let greeks = api.option_greeks("A1", "LMND251219P00060000").await.unwrap();
    assert_eq!(greeks["delta"], "-0.41");
}

#[tokio::test]
async fn test_query_parameters_pass_through() {
    let server = MockServer::start().await;
    mount_exchange(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/userapigateway/trading/instruments"))
        .and(query_param("typeFilter", "EQUITY"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "instruments": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(0), Duration::from_secs(5));
    let request =
        ApiRequest::get("/userapigateway/trading/instruments").query("typeFilter", "EQUITY");

    assert_eq!(client.call(request).await.unwrap().status, 200);
}

#[tokio::test]
async fn test_invalid_account_id_never_hits_network() {
    let server = MockServer::start().await;
    mount_exchange(&server, 0).await;

    let api = PublicApi::new(client_for(&server, fast_retry(0), Duration::from_secs(5)));
    let err = api.portfolio("../admin").await.unwrap_err();

    assert!(matches!(err, ApiError::InvalidPath { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_401s_share_one_forced_refresh() {
    let server = MockServer::start().await;
    mount_exchange(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(100)))
        .expect(8)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accounts": [] })))
        .expect(8)
        .mount(&server)
        .await;

    let client = client_for(&server, fast_retry(0), Duration::from_secs(5));
    let primed = client.token_manager().get_valid_token().await.unwrap();
    assert_eq!(primed.value().expose(), "tok-1");

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let client = client.clone();
        tasks.spawn(async move { client.call(ApiRequest::get(ACCOUNTS_PATH)).await });
    }

    while let Some(joined) = tasks.join_next().await {
        assert_eq!(joined.unwrap().unwrap().status, 200);
    }
    let current = client.token_manager().cached_token().unwrap();
    assert_eq!(current.value().expose(), "tok-2");
}

fn connect_config(server: &MockServer, env_var: &str) -> ClientConfig {
    ClientConfig {
        secret_env_var: env_var.to_string(),
        ..ClientConfig::with_base_url(Url::parse(&server.uri()).unwrap())
    }
}

#[tokio::test]
async fn test_connect_uses_stored_secret_and_persists_token() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(EXCHANGE_PATH))
        .and(body_json(json!({ "validityInMinutes": 60, "secret": "from-store" })))
        .respond_with(TokenSequence(AtomicUsize::new(0)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accounts": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::with_entries([(
        "public-trading/default/secret",
        Secret::new("from-store"),
    )]));
    let config = connect_config(&server, "PT_CONNECT_STORED_UNSET_VAR");

    let api = PublicApi::connect(&config, store.clone()).await.unwrap();
    api.accounts().await.unwrap();

    let persisted = store.get("public-trading/default/access_token").await.unwrap();
    assert_eq!(persisted.unwrap().expose(), "tok-1");
}

#[tokio::test]
async fn test_connect_restores_persisted_token() {
    let server = MockServer::start().await;
    mount_exchange(&server, 0).await;
    Mock::given(method("GET"))
        .and(path(ACCOUNTS_PATH))
        .and(header("Authorization", "Bearer cached"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accounts": [] })))
        .expect(1)
        .mount(&server)
        .await;

    let issued_at = chrono::Utc::now().to_rfc3339();
    let store = Arc::new(MemoryStore::with_entries([
        ("public-trading/default/secret", Secret::new("s")),
        ("public-trading/default/access_token", Secret::new("cached")),
        ("public-trading/default/token_issued_at", Secret::new(issued_at)),
        ("public-trading/default/token_validity_secs", Secret::new("3600")),
    ]));
    let config = connect_config(&server, "PT_CONNECT_RESTORE_UNSET_VAR");

    let api = PublicApi::connect(&config, store).await.unwrap();
    api.accounts().await.unwrap();
}

#[tokio::test]
async fn test_connect_reports_missing_secret_and_bad_config() {
    let server = MockServer::start().await;
    mount_exchange(&server, 0).await;

    let config = connect_config(&server, "PT_CONNECT_MISSING_UNSET_VAR");
    let err = PublicApi::connect(&config, Arc::new(MemoryStore::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, PublicTradingError::Credential(_)));

    let config = ClientConfig {
        token_validity_minutes: 0,
        ..connect_config(&server, "PT_CONNECT_MISSING_UNSET_VAR")
    };
    let err = PublicApi::connect(&config, Arc::new(MemoryStore::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, PublicTradingError::Config(_)));
}
