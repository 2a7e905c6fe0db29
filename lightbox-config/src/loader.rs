//! Config file discovery and parsing.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Config, expand_tilde};

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "LIGHTBOX_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "~/.config/lightbox/config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Load configuration from the default location (or `LIGHTBOX_CONFIG`).
/// A missing file yields the built-in defaults.
pub fn load() -> Result<Config, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from_path(&expand_tilde(&path))
}

/// Load configuration from an explicit path. A missing file yields the
/// built-in defaults; a present-but-invalid file is an error.
pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        info!(path = %path.display(), "no config file found, using defaults");
        return Ok(Config::default().resolve_paths());
    }
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: Config =
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(path = %path.display(), "configuration loaded");
    Ok(config.resolve_paths())
}
