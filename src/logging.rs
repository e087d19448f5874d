//! Structured logging setup, installed once at process entry.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `tracing` subscriber filtered by `RUST_LOG` (default `info`).
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
