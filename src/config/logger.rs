//! Logging section of the process configuration.
//!
//! ```toml
//! [logger]
//! level = "debug"
//! engine_level = "warn"
//!
//! [logger.console]
//! format = "json"
//! show_target = true
//!
//! [logger.journald]
//! enabled = true
//! identifier = "inventory-service"
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Console line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// Level for the application and this library. One of trace, debug,
    /// info, warn, error.
    #[validate(custom(function = "validate_level"))]
    pub level: String,

    /// Level for the MQTT protocol engine underneath the transport, which is
    /// chatty at debug.
    #[validate(custom(function = "validate_level"))]
    pub engine_level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            engine_level: "warn".to_string(),
            console: Some(ConsoleConfig::default()),
            journald: None,
        }
    }
}

impl LoggerConfig {
    /// Filter directives used when `RUST_LOG` is not set.
    pub fn directives(&self) -> String {
        format!(
            "{},rumqttc={}",
            self.level.to_lowercase(),
            self.engine_level.to_lowercase()
        )
    }

    pub fn console_enabled(&self) -> bool {
        self.console.as_ref().is_some_and(|console| console.enabled)
    }

    pub fn journald_enabled(&self) -> bool {
        self.journald.as_ref().is_some_and(|journald| journald.enabled)
    }
}

fn validate_level(level: &str) -> Result<(), ValidationError> {
    if LEVELS.contains(&level.to_lowercase().as_str()) {
        return Ok(());
    }
    let mut err = ValidationError::new("invalid_log_level");
    err.message = Some(format!("Invalid log level '{level}', expected one of {}", LEVELS.join(", ")).into());
    Err(err)
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,
    pub show_target: bool,

    /// Useful to tell callback-thread output from runtime workers.
    pub show_thread_names: bool,
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_names: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` of journal entries.
    #[validate(length(min = 1, message = "Journald identifier cannot be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "lumen".to_string(),
        }
    }
}
