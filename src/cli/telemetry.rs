//! Tracing subscriber initialization.

use anyhow::{Result, anyhow};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber.
///
/// An explicit verbosity level wins; otherwise `RUST_LOG` is honored, and the
/// default is errors only.
///
/// # Errors
/// Returns an error if a subscriber is already installed.
pub fn init(level: Option<Level>) -> Result<()> {
    let filter = match level {
        Some(level) => EnvFilter::new(level.to_string().to_lowercase()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize telemetry: {err}"))
}
