use std::fs;
use std::path::Path;

use thiserror::Error;

use super::merge::apply_env_overrides;
use super::schema::{Config, ConfigLayer};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// Load configuration from an explicit TOML file, then apply `WEFT_*`
/// environment overrides.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut config: Config = toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load an optional override layer; `Ok(None)` if the file is absent.
pub fn load_layer(path: &Path) -> Result<Option<ConfigLayer>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|err| ConfigError::Parse {
            path: path.display().to_string(),
            reason: err.to_string(),
        })
}

/// Defaults, plus an optional layer, plus environment overrides.
pub fn load_or_default(layer_path: Option<&Path>) -> Config {
    let mut config = Config::default();
    if let Some(path) = layer_path {
        match load_layer(path) {
            Ok(Some(layer)) => layer.apply_to(&mut config),
            Ok(None) => {}
            Err(err) => tracing::warn!("config layer load failed, using defaults: {err}"),
        }
    }
    apply_env_overrides(&mut config);
    config
}
