//! Shared fixtures for oxide-cache integration tests.

#![allow(dead_code)]

use oxide_cache::{CacheConfig, RetryPolicy, UploadOptions};
use std::path::{Path, PathBuf};

/// Initialize test logging (call once per test binary).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn,oxide_cache=info")),
        )
        .with_test_writer()
        .try_init();
}

/// Three attempts with a 1ms backoff.
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, 1, 1.0)
}

/// REST config pointed at a mock server.
pub fn rest_config(base_url: &str) -> CacheConfig {
    CacheConfig::rest(base_url, "test-token").with_retry(fast_retry())
}

pub fn upload_options(concurrency: usize, chunk_size: u64) -> UploadOptions {
    UploadOptions {
        concurrency,
        chunk_size,
    }
}

/// Deterministic archive contents of `len` bytes.
pub fn archive_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Write an archive of `len` bytes into `dir`.
pub fn write_archive(dir: &Path, len: usize) -> PathBuf {
    let path = dir.join("cache.tzst");
    std::fs::write(&path, archive_bytes(len)).expect("failed to write archive");
    path
}

pub fn paths() -> Vec<String> {
    vec!["target".to_string(), "~/.cargo/registry".to_string()]
}
