//! Loading and validation of settings.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then environment
//! variables prefixed with `FEDRUN_` that use `__` to separate nested keys
//! (`FEDRUN_EXPERIMENT__NUM_EPOCHS=5`, `FEDRUN_LOG__FILTER=debug`). The drivers apply their
//! command line options last.

use std::{fmt, path::Path};

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::de::{self, Deserializer, Visitor};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

use crate::config::Config;

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    pub rpc: RpcSettings,
    pub experiment: Config,
}

impl Settings {
    /// Loads and validates the settings, from the given file if any.
    ///
    /// # Errors
    /// Fails when the configuration file cannot be read or parsed, or when the
    /// resulting experiment configuration is invalid.
    pub fn new(path: Option<&Path>) -> Result<Self, SettingsError> {
        let settings = Self::load(path)?;
        settings.experiment.validate()?;
        Ok(settings)
    }

    fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigLoader::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        builder
            .add_source(
                Environment::with_prefix("fedrun")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
/// Settings of the RPC link between the server rank and the client ranks.
pub struct RpcSettings {
    /// The address the server rank listens on and the client ranks connect to.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [rpc]
    /// server_address = "127.0.0.1:50051"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDRUN_RPC__SERVER_ADDRESS=127.0.0.1:50051
    /// ```
    pub server_address: String,
    /// How often a waiting client asks the server for the next round, in milliseconds.
    pub poll_interval_ms: u64,
    /// How many times a client tries to reach the server before giving up. The server
    /// rank usually needs a moment to load its data before it listens.
    pub connect_retries: u32,
    /// Delay between two connection attempts, in milliseconds.
    pub connect_delay_ms: u64,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:50051".to_string(),
            poll_interval_ms: 1000,
            connect_retries: 60,
            connect_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LoggingSettings {
    #[serde(default = "default_env_filter")]
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_env_filter(),
        }
    }
}

fn default_env_filter() -> EnvFilter {
    EnvFilter::new("info")
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value).map_err(E::custom)
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
