//! Logging setup.
//!
//! Library code only emits through the `tracing` macros; binaries and test
//! harnesses call [`init_tracing`] once to install a subscriber.

use crate::{traits::Validatable, VigilError, VigilResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// `[logging]` configuration section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG` when set
    pub filter: String,
    /// Emit JSON lines instead of the human readable format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl Validatable for LoggingConfig {
    fn validate(&self) -> VigilResult<()> {
        EnvFilter::try_new(&self.filter)
            .map(|_| ())
            .map_err(|e| VigilError::config(format!("Invalid log filter '{}': {e}", self.filter)))
    }
}

fn build_filter(config: &LoggingConfig) -> VigilResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| VigilError::config(format!("Invalid log filter '{}': {e}", config.filter))),
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> VigilResult<bool> {
    let filter = build_filter(config)?;
    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_ok()
    };
    Ok(installed)
}

/// Initialize test logging routed through the test harness writer
pub fn init_test_tracing(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
