//! Logging configuration.
//!
//! Consumed by [`crate::logger::LoggerManager`]. The `RUST_LOG` environment
//! variable, when set, overrides `level`.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
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
    /// Global log level: trace, debug, info, warn or error (case-insensitive).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Console output. `None` or `enabled = false` leaves no output at all,
    /// which the logger manager refuses.
    #[validate(nested)]
    pub console: Option<ConsoleConfig>,
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            console: Some(ConsoleConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the module path of each event.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Emit an event when a span closes, with its timings. Useful to see how
    /// long each request took, including retries.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}
