//! `hotpotato_tests`
//!
//! Test support shared by the integration tests in `tests/`:
//! - [`loopback`]: an authority session wired to in-memory replicas over a
//!   lossy best-effort channel.

pub mod loopback;

pub use loopback::{LossConfig, Loopback};

/// Installs a test-writer subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}
