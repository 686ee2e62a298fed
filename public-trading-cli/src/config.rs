//! Configuration file discovery and loading.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use public_trading_core::ClientConfig;
use std::path::{Path, PathBuf};

/// A loaded configuration and where it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub client: ClientConfig,

    /// Path that was read, or would have been read if it existed.
    pub path: PathBuf,

    /// Whether the file was present.
    pub from_file: bool,
}

/// Default config file location: `config.toml` in the platform config dir.
pub fn default_config_path() -> PathBuf {
    project_dirs()
        .map(|d| d.config_dir().join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("public-trading.toml"))
}

/// Load configuration from `explicit` or the default location.
///
/// An explicit path must exist. A missing default file yields defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => (default_config_path(), false),
    };

    if !path.exists() {
        if required {
            anyhow::bail!("Config file {:?} does not exist", path);
        }
        return Ok(LoadedConfig {
            client: ClientConfig::default(),
            path,
            from_file: false,
        });
    }

    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {:?}", path))?;
    let client = parse_config(&contents)
        .with_context(|| format!("Failed to parse config from {:?}", path))?;

    Ok(LoadedConfig {
        client,
        path,
        from_file: true,
    })
}

/// Parse and validate a TOML document.
pub fn parse_config(contents: &str) -> Result<ClientConfig> {
    let config: ClientConfig = toml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "public-trading", "public-trading")
}
