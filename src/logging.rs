//! Log bootstrap for binaries and tests.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is the embedding application's call. `init` wires the common case: a fmt
//! layer filtered by `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Installs the default subscriber. Safe to call more than once; only the
/// first call takes effect.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
