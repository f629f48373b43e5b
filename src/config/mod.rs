//! Process configuration: where it comes from and how it is checked.
//!
//! A single TOML file holds a `[logger]` section and a `[client]` section.
//! The file is located through the `LUMEN_CONFIG` environment variable, or
//! `/etc/lumen/config.toml` when the variable is unset.
//!
//! Loading happens before any `tracing` subscriber exists, so progress is
//! reported with the `print_*` macros defined here.

use std::{
    fs,
    path::{Path, PathBuf},
};

use lumen_client::ClientConfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::config::logger::LoggerConfig;

pub mod logger;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "LUMEN_CONFIG";

/// Used when [`CONFIG_ENV`] is unset.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/lumen/config.toml";

#[doc(hidden)]
#[macro_export]
macro_rules! __print_level {
    ($level:expr, $($arg:tt)*) => {{
        let now = time::OffsetDateTime::now_utc()
            .format(time::macros::format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
            ))
            .unwrap_or_default();
        println!("{}  {} {}", console::style(now).dim(), $level, format_args!($($arg)*));
    }};
}

/// Prints a timestamped line before logging is set up.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => { $crate::__print_level!(console::style("INFO").green(), $($arg)*) };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => { $crate::__print_level!(console::style("WARN").yellow(), $($arg)*) };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => { $crate::__print_level!(console::style("ERROR").red(), $($arg)*) };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No configuration file found: set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}")]
    NotFound,

    #[error("Configuration file {0} does not exist")]
    Missing(PathBuf),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Everything a process embedding the client reads at startup.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Passed to [`lumen_client::Client::builder`].
    pub client: ClientConfig,
}

impl Config {
    /// Locates and loads the configuration file.
    pub fn new() -> Result<Self, ConfigError> {
        let path = Self::locate()?;
        Self::load(&path)
    }

    fn locate() -> Result<PathBuf, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }
        Err(ConfigError::NotFound)
    }

    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }

        let text = fs::read_to_string(path)?;
        let config = Self::parse(&text)?;
        print_info!(
            "Loaded config for {} service(s) from: {}",
            config.client.service.len(),
            path.display()
        );
        Ok(config)
    }

    /// Parses and validates TOML text.
    ///
    /// The client section is checked the same way `ClientBuilder::build`
    /// checks it, so a bad service URL fails here instead of at startup.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        config
            .client
            .check()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(config)
    }
}
