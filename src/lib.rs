//! lumen: publish/subscribe client engine with process-level setup.
//!
//! The engine itself lives in the [`lumen_client`] crate and is re-exported
//! here. This crate adds what a service embedding the client needs at
//! startup:
//!
//! * `config`: a TOML file with `[logger]` and `[client]` sections, located
//!   through `LUMEN_CONFIG` and validated before anything connects.
//! * `logger`: installs the `tracing` subscriber (console in compact,
//!   pretty or JSON format, and optionally systemd journald).
//!
//! ```no_run
//! # async fn run() -> Result<(), lumen::StartupError> {
//! let config = lumen::config::Config::new()?;
//! let client = lumen::bootstrap(&config)?
//!     .on_message(|_, message| tracing::info!("{} on {}", message.payload().len(), message.topic()))
//!     .build()?;
//! client.start();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod logger;

pub use lumen_client::*;

use crate::{
    config::{Config, ConfigError},
    logger::{LoggerError, LoggerManager},
};

/// Errors surfaced while bringing a process up.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Logger(#[from] LoggerError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Installs logging from `config` and returns a builder for its client
/// section.
pub fn bootstrap(config: &Config) -> Result<ClientBuilder, StartupError> {
    LoggerManager::new(config.logger.clone())?.init()?;
    tracing::info!(
        "Logging initialized at level {}, client services: {}",
        config.logger.level,
        config.client.service.join(", ")
    );
    Ok(Client::builder(config.client.clone()))
}
