//! Global `tracing` subscriber setup.
//!
//! `LoggerManager` validates the [`LoggerConfig`] and installs a registry with
//! one console layer in the configured format. `RUST_LOG` takes precedence
//! over the configured level.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{fmt, fmt::format::FmtSpan, prelude::*, EnvFilter, Layer, Registry};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig},
    print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("No logging layers were configured")]
    NoLayersConfigured,

    #[error("Logger initialization error: {0}")]
    InitializationError(#[from] tracing_subscriber::util::TryInitError),
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if the configuration is invalid.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;
        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the first event.
    ///
    /// # Errors
    ///
    /// Fails when console output is disabled or a global subscriber is
    /// already set.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.layers();
        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        tracing_subscriber::registry().with(layers).try_init()?;
        Ok(())
    }

    fn layers(&self) -> Vec<BoxedLayer> {
        match &self.config.console {
            Some(console) if console.enabled => vec![self.console_layer(console)],
            _ => Vec::new(),
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(&self, config: &ConsoleConfig) -> BoxedLayer {
        let span_events = if config.show_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = fmt::layer()
            .with_target(config.show_target)
            .with_thread_ids(config.show_thread_ids)
            .with_span_events(span_events)
            .with_ansi(config.ansi_colors)
            .with_writer(io::stdout);

        match config.format {
            LogFormat::Json => base.json().with_filter(self.filter()).boxed(),
            LogFormat::Pretty => base.pretty().with_filter(self.filter()).boxed(),
            LogFormat::Compact => base.compact().with_filter(self.filter()).boxed(),
        }
    }
}
