//! Tracing setup for the daemon.

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. The `APIARY_LOG` environment variable
/// takes an `EnvFilter` directive string; the default is `info`.
pub fn init() {
    let filter = EnvFilter::try_from_env("APIARY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
