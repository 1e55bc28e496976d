//! Logging initialization
//!
//! Builds the process's tracing subscriber from an explicit [`LoggingConfig`]:
//! - `RUST_LOG` always wins when set
//! - otherwise `info` for ket and `warn` for the HTTP/kube stack, or `debug`
//!   for ket when the run asks for it
//! - targets and timestamps are toggled per config

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Errors that can occur during logging initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to install the tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// How log lines are decorated
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// Prefix each line with the emitting module
    pub prefix: bool,
    /// Prefix each line with a timestamp
    pub timestamp: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            prefix: true,
            timestamp: true,
        }
    }
}

/// Default filter directives for the given verbosity
pub fn default_directives(debug: bool) -> &'static str {
    if debug {
        "info,ket_common=debug,ket_job=debug,ket_cli=debug,kube=info,tower=warn,hyper=warn"
    } else {
        "info,kube=warn,tower=warn,hyper=warn"
    }
}

/// Install the global tracing subscriber for this process
///
/// # Example
///
/// ```ignore
/// use ket_common::telemetry::{init_logging, LoggingConfig};
///
/// init_logging(&LoggingConfig::default(), false)?;
/// ```
pub fn init_logging(config: &LoggingConfig, debug: bool) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(debug)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(config.prefix);

    let registry = tracing_subscriber::registry().with(env_filter);
    let result = if config.timestamp {
        registry.with(fmt_layer).try_init()
    } else {
        registry.with(fmt_layer.without_time()).try_init()
    };

    result.map_err(|e: tracing_subscriber::util::TryInitError| {
        TelemetryError::SubscriberInit(e.to_string())
    })
}
