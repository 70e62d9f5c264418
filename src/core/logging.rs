//! Process-wide tracing setup.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the filter directive (e.g. `parley=debug`).
pub const LOG_ENV: &str = "PARLEY_LOG";

/// Install the stderr subscriber. Safe to call more than once; later calls are no-ops.
pub fn init_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
