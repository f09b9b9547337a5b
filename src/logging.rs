//! Tracing initialization.
//!
//! Library code only emits `tracing` events and spans; binaries and dry-run
//! harnesses call [`init`] or [`init_from_config`] once at startup. `RUST_LOG`
//! takes precedence over the configured level so individual modules can be
//! turned up without editing the config file:
//!
//! ```bash
//! RUST_LOG=rust_lab::sequencer=trace
//! ```

use crate::config::LabConfig;
use anyhow::{anyhow, Result};
use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber filtered at `level`.
///
/// Fails if a global subscriber has already been set.
pub fn init(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("rust_lab={}", level)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))
}

/// Installs the global subscriber using `application.log_level`.
pub fn init_from_config(config: &LabConfig) -> Result<()> {
    init(&config.application.log_level)
}
