//! Tracing subscriber setup for processes hosting the dispatch core

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::error::{DispatchError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset, e.g. "info" or "llm_dispatch=debug"
    pub level: String,
    pub json_output: bool,
    /// Only applies to the human-readable format
    pub color_output: bool,
    pub include_line_numbers: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_output: false,
            color_output: true,
            include_line_numbers: cfg!(debug_assertions),
        }
    }
}

impl LoggingConfig {
    pub fn json() -> Self {
        Self {
            json_output: true,
            color_output: false,
            ..Self::default()
        }
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level).map_err(|e| {
                DispatchError::Config(format!("invalid log level '{}': {}", self.level, e))
            }),
        }
    }
}

/// Install the global subscriber.
///
/// Fails with `DispatchError::Config` if a global subscriber is already set.
pub fn init_logging(config: LoggingConfig) -> Result<()> {
    let env_filter = config.env_filter()?;

    let installed = if config.json_output {
        let json_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_current_span(true)
            .with_line_number(config.include_line_numbers);

        tracing::subscriber::set_global_default(Registry::default().with(env_filter).with(json_layer))
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_line_number(config.include_line_numbers)
            .with_ansi(config.color_output)
            .with_span_events(FmtSpan::CLOSE);

        tracing::subscriber::set_global_default(Registry::default().with(env_filter).with(fmt_layer))
    };

    installed.map_err(|e| DispatchError::Config(format!("logging already initialized: {}", e)))
}
