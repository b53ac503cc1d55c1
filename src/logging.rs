//! Stderr-only structured logging.
//!
//! Keeps stdout reserved for machine-readable output (CI-style text and
//! JSON) while all diagnostics go to stderr via `tracing`.

use tracing_subscriber::EnvFilter;

/// Initialize the global `tracing` subscriber. `verbose` raises the
/// default level from `warn` to `info`; `RUST_LOG`/`VERBOSE` (already
/// folded into `Config` by the caller) may be used to set an explicit
/// filter via `EnvFilter::try_from_default_env`.
pub fn init(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .try_init();
}
