//! Deterministic simulation harness for the Tether session layer.
//!
//! Provides [`SimNet`], an in-memory network fabric with a manually
//! advanced clock, and [`SimEnv`], its [`tether_core::Environment`]
//! implementation. Tests drive real `Client` and `Server` instances over
//! the fabric with full control over time, delivery chunking, datagram
//! loss, and connection resets - no real sockets, no timers, perfect
//! reproducibility.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod sim;

pub use sim::{SimEnv, SimNet};

/// Install a test subscriber for `tracing` output, once per process.
///
/// Safe to call from every test; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with_test_writer()
        .try_init();
}
