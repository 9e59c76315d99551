//! Log output for hosts that do not install their own subscriber.

use tracing_subscriber::EnvFilter;

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, or by `default_filter` when it is unset.
///
/// Returns `Ok(false)` if a global subscriber was already installed.
pub fn init(default_filter: &str) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter)
            .map_err(|e| BridgeError::config_with_source(format!("invalid log filter '{default_filter}'"), Box::new(e)))?,
    };
    Ok(tracing_subscriber::fmt().with_env_filter(filter).with_target(true).try_init().is_ok())
}

pub fn init_from_config(config: &BridgeConfig) -> Result<bool> {
    init(&config.log_filter)
}
