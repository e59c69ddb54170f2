// src/infra/logger.rs — Log setup for the collector

use tracing_subscriber::{fmt, EnvFilter};

/// Compact log output. `default_level` applies unless `RUST_LOG` is set,
/// which lets operators raise verbosity per module at launch.
pub fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
