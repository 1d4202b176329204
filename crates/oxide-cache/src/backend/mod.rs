//! Storage backends behind one cache contract.
//!
//! Exactly one backend serves a call. It is chosen from which configuration
//! sections are present and never swapped for another after a failure.

pub mod blob;
pub mod object_store;
pub mod ranged;
pub mod rest;

use crate::config::{CacheConfig, DownloadOptions, UploadOptions};
use crate::file::SharedFile;
use crate::retry::RetryExecutor;
use oxide_core::{CacheEntry, Error, ReserveResult, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

pub use blob::{BlobStoreBackend, BlobTransfer, SasBlobClient};
pub use object_store::{ObjectStore, ObjectStoreBackend, S3ObjectStore};
pub use rest::{CacheListing, RestBackend};

/// Which backend a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Rest,
    BlobStore,
    ObjectStore,
}

impl BackendKind {
    /// Object store config wins, then blob SDK settings, then the plain service.
    pub fn select(config: &CacheConfig) -> Result<Self> {
        if config.object_store.is_some() {
            return Ok(Self::ObjectStore);
        }
        match (&config.blob, &config.service) {
            (Some(_), Some(_)) => Ok(Self::BlobStore),
            (Some(_), None) => Err(Error::Validation(
                "blob transfers require the cache service configuration".into(),
            )),
            (None, Some(_)) => Ok(Self::Rest),
            (None, None) => Err(Error::Validation(
                "no cache backend configured: set service or object_store".into(),
            )),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rest => write!(f, "rest"),
            Self::BlobStore => write!(f, "blob-store"),
            Self::ObjectStore => write!(f, "object-store"),
        }
    }
}

/// The active backend for a session.
#[derive(Clone)]
pub enum Backend {
    Rest(RestBackend),
    BlobStore(BlobStoreBackend),
    ObjectStore(ObjectStoreBackend),
}

impl Backend {
    /// Build the backend the configuration selects.
    pub fn from_config(config: &CacheConfig) -> Result<Self> {
        let retry = RetryExecutor::new(config.retry);
        let kind = BackendKind::select(config)?;
        let service = || {
            config
                .service
                .clone()
                .ok_or_else(|| Error::Validation("cache service configuration is required".into()))
        };

        match kind {
            BackendKind::Rest => Ok(Self::Rest(RestBackend::new(service()?, retry)?)),
            BackendKind::BlobStore => {
                let blob = config
                    .blob
                    .as_ref()
                    .ok_or_else(|| Error::Validation("blob configuration is required".into()))?;
                let rest = RestBackend::new(service()?, retry)?;
                let client = SasBlobClient::new(blob, retry)?;
                Ok(Self::BlobStore(BlobStoreBackend::new(rest, Arc::new(client), blob)))
            }
            BackendKind::ObjectStore => {
                let store = config.object_store.as_ref().ok_or_else(|| {
                    Error::Validation("object store configuration is required".into())
                })?;
                Ok(Self::ObjectStore(ObjectStoreBackend::new(
                    Arc::new(S3ObjectStore::new(store)),
                    retry,
                )))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Rest(_) => BackendKind::Rest,
            Self::BlobStore(_) => BackendKind::BlobStore,
            Self::ObjectStore(_) => BackendKind::ObjectStore,
        }
    }

    /// The cache service client, when this backend talks to one.
    pub fn service(&self) -> Option<&RestBackend> {
        match self {
            Self::Rest(rest) => Some(rest),
            Self::BlobStore(blob) => Some(blob.service()),
            Self::ObjectStore(_) => None,
        }
    }

    /// Find the entry for `keys`. The object store ignores `version`.
    pub async fn lookup(&self, keys: &[String], version: &str) -> Result<Option<CacheEntry>> {
        match self {
            Self::Rest(rest) => rest.get_cache_entry(keys, version).await,
            Self::BlobStore(blob) => blob.lookup(keys, version).await,
            Self::ObjectStore(store) => store.lookup(keys).await,
        }
    }

    pub async fn reserve(&self, key: &str, version: &str, size_hint: Option<u64>) -> Result<ReserveResult> {
        match self {
            Self::Rest(rest) => rest.reserve_cache(key, version, size_hint).await,
            Self::BlobStore(blob) => blob.reserve(key, version, size_hint).await,
            Self::ObjectStore(store) => Ok(store.reserve()),
        }
    }

    /// Move the archive at `path` to storage, returning bytes uploaded.
    pub async fn upload(
        &self,
        key: &str,
        cache_id: Option<u64>,
        path: &Path,
        options: UploadOptions,
    ) -> Result<u64> {
        match self {
            Self::Rest(rest) => {
                let cache_id = require_cache_id(cache_id)?;
                let file = SharedFile::open(path).await?;
                Ok(rest.upload_archive(cache_id, file, options).await?.bytes)
            }
            Self::BlobStore(blob) => blob.upload(path).await,
            Self::ObjectStore(store) => {
                let file = SharedFile::open(path).await?;
                store.upload(key, file, options).await
            }
        }
    }

    /// Finalize an upload. A no-op for the object store.
    pub async fn commit(&self, cache_id: Option<u64>, size: u64) -> Result<()> {
        match self {
            Self::Rest(rest) => rest.commit_cache(require_cache_id(cache_id)?, size).await,
            Self::BlobStore(blob) => blob.commit(require_cache_id(cache_id)?, size).await,
            Self::ObjectStore(_) => Ok(()),
        }
    }

    pub async fn download(&self, entry: &CacheEntry, path: &Path, options: DownloadOptions) -> Result<u64> {
        match self {
            Self::Rest(rest) => rest.download_archive(&entry.location, path, options).await,
            Self::BlobStore(blob) => blob.download(entry, path).await,
            Self::ObjectStore(store) => store.download(entry, path).await,
        }
    }
}

fn require_cache_id(cache_id: Option<u64>) -> Result<u64> {
    cache_id.ok_or_else(|| Error::Internal("upload requires a reserved cache id".into()))
}
