//! Public Trading CLI
//!
//! Command-line access to the Public brokerage API.
//!
//! # Usage
//!
//! ```bash
//! # Store the trading secret in the OS keyring
//! echo "$SECRET" | public-trading set-secret
//!
//! # List accounts and show the brokerage portfolio
//! public-trading accounts
//! public-trading portfolio --account-type BROKERAGE
//!
//! # Quote the configured watchlist, or explicit symbols
//! public-trading quotes
//! public-trading quotes LMND251219P00060000 --option
//! ```

mod client;
mod config;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use public_trading_core::credential::SECRET_ENTRY;
use public_trading_core::store::{STORE_NAMESPACE, secret_key};
use public_trading_core::{
    ApiRequest, ClientConfig, Instrument, Method, Secret, SecretStore,
};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt};

use crate::client::{Session, parse_query_pairs};

#[derive(Parser)]
#[command(name = "public-trading")]
#[command(about = "Command-line client for the Public brokerage API")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to config.toml in the platform config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Profile namespacing the stored secret and cached token
    #[arg(short, long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Which account a command runs against.
#[derive(Args, Debug, Default)]
struct AccountArgs {
    /// Account id to use
    #[arg(long, conflicts_with = "account_type")]
    account_id: Option<String>,

    /// Pick the account of this type (e.g. BROKERAGE, ROTH_IRA)
    #[arg(long)]
    account_type: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List accounts
    Accounts,

    /// Show positions and balances for an account
    Portfolio {
        #[command(flatten)]
        account: AccountArgs,
    },

    /// List tradable instruments
    Instruments,

    /// Quote symbols (defaults to the configured watchlist)
    Quotes {
        /// Symbols to quote
        symbols: Vec<String>,

        /// Treat the given symbols as OSI option symbols
        #[arg(long)]
        option: bool,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// List option expiration dates for an underlying
    Expirations {
        /// Underlying equity symbol
        symbol: String,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Show the option chain for an underlying and expiration
    Chain {
        /// Underlying equity symbol
        symbol: String,

        /// Expiration date (YYYY-MM-DD)
        expiration: String,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Show greeks for an option
    Greeks {
        /// OSI option symbol (e.g. LMND251219P00060000)
        osi_symbol: String,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Preflight a single-leg order without placing it
    Preflight {
        /// Order as a JSON object
        #[arg(long)]
        body: String,

        #[command(flatten)]
        account: AccountArgs,
    },

    /// Issue a raw authenticated request
    Call {
        /// HTTP method (GET, POST, ...)
        method: String,

        /// Path relative to the API host
        path: String,

        /// Query parameter as key=value (repeatable)
        #[arg(short, long = "query")]
        query: Vec<String>,

        /// JSON request body
        #[arg(short, long)]
        body: Option<String>,
    },

    /// Acquire an access token and show its lifetime
    Token {
        /// Print the token value
        #[arg(long)]
        reveal: bool,
    },

    /// Read the trading secret from stdin into the OS keyring
    SetSecret,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose);

    let loaded = config::load_config(cli.config.as_deref())?;
    let mut client_config = loaded.client;
    if let Some(profile) = cli.profile {
        client_config.profile = profile;
    }
    client_config
        .validate()
        .context("Invalid configuration after command-line overrides")?;
    debug!(path = ?loaded.path, from_file = loaded.from_file, "Loaded configuration");

    match cli.command {
        Commands::Config => print_config(&client_config, &loaded.path, loaded.from_file),
        Commands::SetSecret => set_secret(&client_config.profile).await,
        command => {
            let session = Session::open(client_config).await?;
            run(&session, command).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(session: &Session, command: Commands) -> Result<()> {
    let api = &session.api;

    let output = match command {
        Commands::Accounts => api.accounts().await?,
        Commands::Portfolio { account } => {
            let id = account_id(session, &account).await?;
            api.portfolio(&id).await?
        }
        Commands::Instruments => api.instruments().await?,
        Commands::Quotes {
            symbols,
            option,
            account,
        } => {
            let instruments = quote_instruments(session, symbols, option);
            if instruments.is_empty() {
                anyhow::bail!("No symbols given and the watchlist is empty");
            }
            let id = account_id(session, &account).await?;
            api.quotes(&id, &instruments).await?
        }
        Commands::Expirations { symbol, account } => {
            let id = account_id(session, &account).await?;
            api.option_expirations(&id, &Instrument::equity(symbol)).await?
        }
        Commands::Chain {
            symbol,
            expiration,
            account,
        } => {
            let id = account_id(session, &account).await?;
            api.option_chain(&id, &Instrument::equity(symbol), &expiration)
                .await?
        }
        Commands::Greeks {
            osi_symbol,
            account,
        } => {
            let id = account_id(session, &account).await?;
            api.option_greeks(&id, &osi_symbol).await?
        }
        Commands::Preflight { body, account } => {
            let order: Value =
                serde_json::from_str(&body).context("Order body is not valid JSON")?;
            let id = account_id(session, &account).await?;
            api.preflight_single_leg(&id, order).await?
        }
        Commands::Call {
            method,
            path,
            query,
            body,
        } => return raw_call(session, &method, path, &query, body.as_deref()).await,
        Commands::Token { reveal } => return show_token(session, reveal).await,
        Commands::SetSecret | Commands::Config => {
            anyhow::bail!("This command does not talk to the API")
        }
    };

    print_json(&output)
}

async fn account_id(session: &Session, account: &AccountArgs) -> Result<String> {
    session
        .resolve_account(account.account_id.as_deref(), account.account_type.as_deref())
        .await
}

fn quote_instruments(session: &Session, symbols: Vec<String>, option: bool) -> Vec<Instrument> {
    if symbols.is_empty() {
        let watchlist = &session.config().watchlist;
        return watchlist
            .stocks
            .iter()
            .map(Instrument::equity)
            .chain(watchlist.options.iter().map(Instrument::option))
            .collect();
    }

    symbols
        .into_iter()
        .map(|symbol| {
            if option {
                Instrument::option(symbol)
            } else {
                Instrument::equity(symbol)
            }
        })
        .collect()
}

async fn raw_call(
    session: &Session,
    method: &str,
    path: String,
    query: &[String],
    body: Option<&str>,
) -> Result<()> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method {:?}", method))?;

    let mut request = ApiRequest::new(method, path);
    for (key, value) in parse_query_pairs(query)? {
        request = request.query(key, value);
    }
    if let Some(body) = body {
        let value: Value = serde_json::from_str(body).context("Request body is not valid JSON")?;
        request = request.json_body(value);
    }

    let response = session.api.client().call(request).await?;
    info!(status = response.status, bytes = response.body.len(), "Request completed");

    match response.json::<Value>() {
        Ok(value) => print_json(&value),
        Err(_) => {
            println!("{}", response.text());
            Ok(())
        }
    }
}

async fn show_token(session: &Session, reveal: bool) -> Result<()> {
    let token = session
        .tokens()
        .get_valid_token()
        .await
        .context("Failed to acquire access token")?;

    let now = Utc::now();
    println!("Issued:    {}", token.issued_at().to_rfc3339());
    println!("Expires:   {}", token.expires_at().to_rfc3339());
    println!("Remaining: {}s", token.remaining_at(now).num_seconds());
    if reveal {
        println!("Token:     {}", token.value().expose());
    }
    Ok(())
}

async fn set_secret(profile: &str) -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("Failed to read secret from stdin")?;
    let secret = Secret::new(input.trim());
    if secret.is_blank() {
        anyhow::bail!("No secret given on stdin");
    }

    let store = public_trading_core::KeyringStore::try_new(STORE_NAMESPACE)
        .context("OS keyring is unavailable")?;
    let key = secret_key(profile, SECRET_ENTRY);
    store
        .set(&key, &secret)
        .await
        .with_context(|| format!("Failed to store secret under {}", key))?;

    println!("Stored trading secret for profile {}", profile);
    Ok(())
}

fn print_config(config: &ClientConfig, path: &Path, from_file: bool) -> Result<()> {
    if from_file {
        println!("# Loaded from {}", path.display());
    } else {
        println!("# Defaults ({} not found)", path.display());
    }
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    print!("{}", rendered);
    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
