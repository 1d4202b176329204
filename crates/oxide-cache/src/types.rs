//! Requests, results and counters for restore and save calls.

use oxide_core::{CacheEntry, CompressionMethod};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Inputs for one restore call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRestoreRequest {
    /// Key tried first; must match exactly.
    pub key: String,
    /// Fallback prefixes tried in order if the primary key misses.
    #[serde(default)]
    pub restore_keys: Vec<String>,
    /// Paths the archive covers; only used for the version fingerprint.
    pub paths: Vec<String>,
    #[serde(default)]
    pub compression: CompressionMethod,
    /// Allow entries saved on a different OS.
    #[serde(default)]
    pub cross_os: bool,
    /// Where the downloaded archive is written.
    pub archive_path: PathBuf,
}

impl CacheRestoreRequest {
    pub fn new(key: impl Into<String>, paths: Vec<String>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            restore_keys: vec![],
            paths,
            compression: CompressionMethod::default(),
            cross_os: false,
            archive_path: archive_path.into(),
        }
    }

    pub fn with_restore_keys(mut self, restore_keys: Vec<String>) -> Self {
        self.restore_keys = restore_keys;
        self
    }

    /// Primary key followed by the restore keys.
    pub fn keys(&self) -> Vec<String> {
        std::iter::once(self.key.clone())
            .chain(self.restore_keys.iter().cloned())
            .collect()
    }
}

/// Inputs for one save call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSaveRequest {
    /// Object key or service key the archive is stored under.
    pub key: String,
    /// Paths the archive covers; only used for the version fingerprint.
    pub paths: Vec<String>,
    #[serde(default)]
    pub compression: CompressionMethod,
    #[serde(default)]
    pub cross_os: bool,
    /// Archive built by the caller.
    pub archive_path: PathBuf,
}

impl CacheSaveRequest {
    pub fn new(key: impl Into<String>, paths: Vec<String>, archive_path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            paths,
            compression: CompressionMethod::default(),
            cross_os: false,
            archive_path: archive_path.into(),
        }
    }
}

/// Outcome of a restore call.
#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// Resolved entry; `None` on a miss.
    pub entry: Option<CacheEntry>,
    /// Key of the resolved entry, possibly found through a restore key.
    pub matched_key: Option<String>,
    /// The primary key matched.
    pub exact_match: bool,
    /// Whether the archive was written to `archive_path`.
    pub downloaded: bool,
    /// Wall time of the call.
    pub duration_ms: u64,
}

/// Outcome of a committed save.
#[derive(Debug, Clone)]
pub struct SaveResult {
    /// Server-issued id; `None` for the object store.
    pub cache_id: Option<u64>,
    pub size_bytes: u64,
    /// Wall time of the call.
    pub duration_ms: u64,
}

/// Counters kept by a session across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub uploads: u64,
    pub total_bytes_downloaded: u64,
    pub total_bytes_uploaded: u64,
}

/// Bytes moved so far in one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub transferred: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.transferred as f64 * 100.0 / self.total as f64
    }
}

/// Observer for transfer progress.
pub type ProgressFn = Arc<dyn Fn(TransferProgress) + Send + Sync>;
