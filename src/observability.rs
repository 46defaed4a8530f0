//! Structured logging setup.
//!
//! Every component logs through `tracing` under a `flowhost::<component>`
//! target (`flowhost::host`, `flowhost::agent`, `flowhost::machine`,
//! `flowhost::messaging`, ...). Call [`init_logging`] once at process start
//! or leave subscriber installation to the embedding application.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log format options for structured logging
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Structured JSON output for log aggregators
    Json,
    /// Human-readable multi-line output
    Pretty,
    /// Single-line output
    #[default]
    Compact,
}

/// Logging configuration.
///
/// ```rust,no_run
/// use flowhost::observability::{init_logging, LogFormat, ObservabilityConfig};
///
/// init_logging(&ObservabilityConfig {
///     log_format: LogFormat::Json,
///     log_level: "debug".to_string(),
/// })
/// .ok();
/// ```
///
/// `RUST_LOG`, when set, overrides `log_level` entirely.
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    pub log_format: LogFormat,
    /// Level applied to the `flowhost` targets; everything else logs at `warn`.
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Compact,
            log_level: "info".to_string(),
        }
    }
}

pub(crate) fn default_filter_expression(level: &str) -> String {
    format!("warn,flowhost={level}")
}

/// Install a global subscriber. Fails when one is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter_expression(&config.log_level)));

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .map_err(|e| format!("Failed to initialize JSON logging: {e}")),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .map_err(|e| format!("Failed to initialize pretty logging: {e}")),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init()
            .map_err(|e| format!("Failed to initialize compact logging: {e}")),
    }
}
