//! Development tracing helpers.
//!
//! Call [`init`] from binaries and examples to get `RUST_LOG`-controlled
//! structured logs. Library code only ever emits events; installing a
//! subscriber is the application's decision.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber honoring `RUST_LOG` (default `info`).
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Install a verbose subscriber for debugging test runs.
pub fn init_debug() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_target(false)
        .try_init();
}
