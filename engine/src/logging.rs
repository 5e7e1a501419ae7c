//! Diagnostic tracing for the orchestrator and its workers.
//!
//! Output always goes to stderr: a worker's stdout carries the reply
//! protocol, so nothing else may be written there.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install a compact stderr subscriber.
///
/// Reads `RUST_LOG`; falls back to `default_directive` when unset or invalid.
/// Safe to call more than once (later calls are no-ops), which matters for
/// tests that share a process.
///
/// # Example
/// ```bash
/// RUST_LOG=engine=debug,eval=debug eval run
/// ```
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}
