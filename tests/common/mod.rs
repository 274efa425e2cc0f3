//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use drugbank_graph::{config::ImportConfig, manager::Manager};
use std::path::PathBuf;
use tempfile::TempDir;

/// Initialize tracing for tests, respecting RUST_LOG env var.
///
/// Safe to call multiple times; later calls are no-ops.
#[allow(dead_code)]
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init()
        .ok();
}

/// Path of a document under `tests/fixtures/`.
#[allow(dead_code)]
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// Config pointing at a fresh cache file inside `temp_dir`.
#[allow(dead_code)]
pub fn test_config(temp_dir: &TempDir) -> ImportConfig {
    ImportConfig::new(temp_dir.path().join("drugbank_cache.db"))
}

/// Manager over an empty cache. Keep the returned [TempDir] alive for the test's duration.
#[allow(dead_code)]
pub async fn open_manager() -> (TempDir, Manager) {
    init_logging();
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::open(test_config(&temp_dir)).await.unwrap();
    (temp_dir, manager)
}
