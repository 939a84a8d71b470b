//! Application configuration loading and validation.
//!
//! `Config` aggregates the logger, client and probe sections of one TOML file.
//! It is loaded once at startup, validated as a whole, and treated as
//! immutable afterwards.
//!
//! ```toml
//! [logger]
//! level = "info"
//!
//! [client]
//! url = "ws://127.0.0.1:3000"
//! access_token = "secret"
//!
//! [probe]
//! rooms = ["room-a"]
//! interval_secs = 30
//!
//! [[probe.requests]]
//! verb = "GET"
//! url = "/users/5"
//! ```

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tether_client::ClientConfig;
use validator::Validate;

use self::{logger::LoggerConfig, probe::ProbeConfig};

pub mod logger;
pub mod probe;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "TETHER_CONFIG";

/// Path tried when `TETHER_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tether/config.toml";

/// Timestamp for the `print_*` macros, which run before any subscriber exists.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    time::format_description::parse(
        "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z",
    )
    .ok()
    .and_then(|format| time::OffsetDateTime::now_utc().format(&format).ok())
    .unwrap_or_default()
}

#[doc(hidden)]
#[macro_export]
macro_rules! print_line {
    ($level:expr, $($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            $level,
            format_args!($($arg)*)
        );
    };
}

/// Timestamped console lines for use before the tracing subscriber is up.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::print_line!(console::style("INFO").green(), $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::print_line!(console::style("WARN").yellow(), $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::print_line!(console::style("ERROR").red(), $($arg)*) };
}

/// Errors raised while locating, reading, parsing or validating the config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Logging subsystem configuration.
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Connection settings handed to the client unchanged.
    #[validate(nested)]
    pub client: ClientConfig,

    /// Rooms to join and requests to issue.
    #[validate(nested)]
    pub probe: ProbeConfig,
}

impl Config {
    /// Locates the configuration file and loads it.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if no file is found or it fails to load.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority: `TETHER_CONFIG`, then `/etc/tether/config.toml`.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {} or create {}",
            CONFIG_ENV, DEFAULT_CONFIG_PATH
        )))
    }

    /// Loads and validates configuration from `path`.
    ///
    /// # Errors
    ///
    /// Propagates IO, parsing and validation errors as `ConfigError`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let config = Self::parse(&fs::read_to_string(path)?)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn parse(source: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
