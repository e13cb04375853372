//! Helpers for unit tests inside this crate.
//!
//! Integration tests should use the `loadcache-test` crate instead, which also provides test
//! fetchers and decoders.

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs so that all console output is captured by the test runner.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("loadcache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}
