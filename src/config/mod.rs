//! Layered TOML configuration.

mod load;
mod merge;
mod schema;

pub use load::{ConfigError, load_from, load_layer, load_or_default};
pub use merge::apply_env_overrides;
pub use schema::{
    Config, ConfigLayer, FileLoggingConfig, LogFormat, LogRotation, LoggingConfig, LoggingLayer,
};
