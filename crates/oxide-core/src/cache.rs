//! Cache types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored cache archive matched by a lookup.
///
/// Entries are immutable: the location is resolved once and used for a
/// single download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The key the archive was saved under (may differ from the lookup key
    /// when a restore prefix matched).
    pub key: String,
    /// Scope the service stored the entry under, if it reports one.
    pub scope: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Archive URL or backend-native identifier.
    pub location: String,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            scope: None,
            created_at: None,
            location: location.into(),
        }
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }
}

/// Archive compression, part of the cache version fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompressionMethod {
    Gzip,
    /// zstd without `--long`, used where the long window is unsupported.
    ZstdWithoutLong,
    #[default]
    Zstd,
}

impl CompressionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMethod::Gzip => "gzip",
            CompressionMethod::ZstdWithoutLong => "zstd-without-long",
            CompressionMethod::Zstd => "zstd",
        }
    }
}

/// Outcome of reserving a write slot for a key and version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveResult {
    /// Server-issued handle; `None` for backends keyed directly by name.
    pub cache_id: Option<u64>,
    pub success: bool,
}

impl ReserveResult {
    pub fn reserved(cache_id: u64) -> Self {
        Self {
            cache_id: Some(cache_id),
            success: true,
        }
    }

    /// Success without a handle.
    pub fn keyed() -> Self {
        Self {
            cache_id: None,
            success: true,
        }
    }
}
