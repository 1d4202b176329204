//! Restore and save orchestration over the configured backend.

use crate::backend::{Backend, BackendKind};
use crate::config::CacheConfig;
use crate::keys::{cache_version, validate_key, validate_keys};
use crate::types::{CacheRestoreRequest, CacheSaveRequest, CacheStats, RestoreResult, SaveResult};
use oxide_core::{CacheEntry, CompressionMethod, Error, ReserveResult, Result};
use std::fmt;
use std::path::Path;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{Level, debug, info, warn};

/// Largest archive the cache accepts.
pub const MAX_ARCHIVE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Progress of a restore call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Resolving,
    Found,
    NotFound,
}

/// Progress of a save call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    Idle,
    Reserving,
    Reserved,
    Conflict,
    Uploading,
    Committing,
    Done,
    Failed,
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Reserving => "reserving",
            Self::Reserved => "reserved",
            Self::Conflict => "conflict",
            Self::Uploading => "uploading",
            Self::Committing => "committing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cache operations against one backend.
pub struct CacheSession {
    backend: Backend,
    config: CacheConfig,
    stats: Mutex<CacheStats>,
}

impl CacheSession {
    /// Validate `config` and build the backend it selects.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = Backend::from_config(&config)?;
        info!(backend = %backend.kind(), "cache session ready");
        Ok(Self::with_backend(backend, config))
    }

    /// Use an already constructed backend.
    pub fn with_backend(backend: Backend, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }

    /// Find the entry for `keys` (primary first) at `version`.
    pub async fn lookup(&self, keys: &[String], version: &str) -> Result<Option<CacheEntry>> {
        validate_keys(keys)?;
        let entry = self.backend.lookup(keys, version).await?;
        if entry.is_none() {
            if let Some(primary) = keys.first() {
                self.log_other_versions(primary, version).await;
            }
        }
        Ok(entry)
    }

    /// Download a resolved entry to `path`.
    pub async fn download(&self, entry: &CacheEntry, path: &Path) -> Result<u64> {
        let bytes = self
            .backend
            .download(entry, path, self.config.download)
            .await?;
        self.record(|s| s.total_bytes_downloaded += bytes);
        Ok(bytes)
    }

    /// Reserve a write slot for `key` at `version`.
    pub async fn reserve(&self, key: &str, version: &str, size_hint: Option<u64>) -> Result<ReserveResult> {
        validate_key(key)?;
        self.backend.reserve(key, version, size_hint).await
    }

    /// Resolve the request's keys and download the match unless lookup-only.
    pub async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult> {
        let start = Instant::now();
        let keys = request.keys();
        let version = version_for(&request.paths, request.compression, request.cross_os)?;

        let mut state = RestoreState::Idle;
        debug!(key = %request.key, ?state, "restore starting");
        state = RestoreState::Resolving;
        debug!(key = %request.key, version = %version, ?state, "resolving cache entry");

        let Some(entry) = self.lookup(&keys, &version).await? else {
            state = RestoreState::NotFound;
            self.record(|s| s.misses += 1);
            info!(key = %request.key, ?state, "cache miss");
            return Ok(RestoreResult {
                entry: None,
                matched_key: None,
                exact_match: false,
                downloaded: false,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        };

        state = RestoreState::Found;
        let exact_match = entry.key == request.key;
        self.record(|s| s.hits += 1);
        info!(key = %request.key, matched = %entry.key, exact_match, ?state, "cache hit");

        let downloaded = if self.config.download.lookup_only {
            debug!(matched = %entry.key, "lookup only, skipping download");
            false
        } else {
            let bytes = self.download(&entry, &request.archive_path).await?;
            info!(matched = %entry.key, bytes, "cache restored");
            true
        };

        Ok(RestoreResult {
            matched_key: Some(entry.key.clone()),
            entry: Some(entry),
            exact_match,
            downloaded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Reserve, upload and commit the request's archive.
    ///
    /// Commit runs only after every chunk uploaded. A reserve conflict means
    /// another job is saving the same key and version.
    pub async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult> {
        let start = Instant::now();
        validate_key(&request.key)?;
        let version = version_for(&request.paths, request.compression, request.cross_os)?;
        let size = archive_size(&request.archive_path).await?;

        let mut state = SaveState::Idle;
        let result = self
            .run_save(request, &version, size, &mut state)
            .await;

        match result {
            Ok((cache_id, bytes)) => {
                self.record(|s| {
                    s.uploads += 1;
                    s.total_bytes_uploaded += bytes;
                });
                info!(key = %request.key, size, %state, backend = %self.kind(), "cache saved");
                Ok(SaveResult {
                    cache_id,
                    size_bytes: size,
                    duration_ms: start.elapsed().as_millis() as u64,
                })
            }
            Err(e) if e.is_reserve_conflict() => {
                info!(key = %request.key, %state, "another job is saving this cache");
                Err(e)
            }
            Err(e) => {
                warn!(key = %request.key, %state, error = %e, "cache save failed");
                Err(e)
            }
        }
    }

    async fn run_save(
        &self,
        request: &CacheSaveRequest,
        version: &str,
        size: u64,
        state: &mut SaveState,
    ) -> Result<(Option<u64>, u64)> {
        *state = SaveState::Reserving;
        let reserved = match self.backend.reserve(&request.key, version, Some(size)).await {
            Ok(reserved) if reserved.success => reserved,
            Ok(_) => {
                *state = SaveState::Conflict;
                return Err(Error::ReserveConflict {
                    key: request.key.clone(),
                });
            }
            Err(e) => {
                *state = if e.is_reserve_conflict() {
                    SaveState::Conflict
                } else {
                    SaveState::Failed
                };
                return Err(e);
            }
        };
        *state = SaveState::Reserved;
        debug!(key = %request.key, cache_id = ?reserved.cache_id, %state, "cache reserved");

        *state = SaveState::Uploading;
        let bytes = match self
            .backend
            .upload(&request.key, reserved.cache_id, &request.archive_path, self.config.upload)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                *state = SaveState::Failed;
                return Err(e);
            }
        };

        *state = SaveState::Committing;
        if let Err(e) = self.backend.commit(reserved.cache_id, size).await {
            *state = SaveState::Failed;
            return Err(e);
        }

        *state = SaveState::Done;
        Ok((reserved.cache_id, bytes))
    }

    /// Log which versions exist for a key that missed. Only runs with debug
    /// logging enabled and never changes the lookup outcome.
    async fn log_other_versions(&self, key: &str, version: &str) {
        if !tracing::enabled!(Level::DEBUG) {
            return;
        }
        let Some(service) = self.backend.service() else {
            return;
        };

        match service.list_caches(key).await {
            Ok(listings) if listings.is_empty() => {
                debug!(key, "no cache stored under this key");
            }
            Ok(listings) => {
                for listing in listings {
                    debug!(
                        key,
                        requested_version = version,
                        stored_version = listing.cache_version.as_deref().unwrap_or("unknown"),
                        scope = listing.scope.as_deref().unwrap_or("unknown"),
                        created = ?listing.creation_time,
                        "other version stored for key"
                    );
                }
            }
            Err(e) => warn!(key, error = %e, "failed to list cache versions"),
        }
    }
}

fn version_for(paths: &[String], compression: CompressionMethod, cross_os: bool) -> Result<String> {
    if paths.is_empty() {
        return Err(Error::Validation(
            "at least one path is required to compute the cache version".into(),
        ));
    }
    Ok(cache_version(paths, compression, cross_os))
}

async fn archive_size(path: &Path) -> Result<u64> {
    let size = tokio::fs::metadata(path).await?.len();
    if size == 0 {
        return Err(Error::Validation(format!(
            "archive {} is empty",
            path.display()
        )));
    }
    if size > MAX_ARCHIVE_SIZE {
        return Err(Error::Validation(format!(
            "archive size of {} bytes exceeds the {} byte limit",
            size, MAX_ARCHIVE_SIZE
        )));
    }
    Ok(size)
}
