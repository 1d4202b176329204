//! Cache REST service client.
//!
//! Every call goes through the retry executor. Status handling lives here and
//! nowhere else: 204 on lookup is a miss, 409 on reserve is a conflict, and
//! any other non-2xx becomes [`Error::Service`].

use super::ranged::{RangedDownloader, service_error, transport};
use crate::chunk::ChunkRange;
use crate::config::{DownloadOptions, ServiceConfig, UploadOptions};
use crate::file::SharedFile;
use crate::pool::{TransferSummary, TransferWorkerPool};
use crate::retry::RetryExecutor;
use chrono::{DateTime, Utc};
use oxide_core::{CacheEntry, Error, ReserveResult, Result};
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

const USER_AGENT: &str = concat!("oxide-cache/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactCacheEntry {
    cache_key: Option<String>,
    scope: Option<String>,
    creation_time: Option<DateTime<Utc>>,
    archive_location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArtifactCacheList {
    #[serde(default)]
    artifact_caches: Vec<CacheListing>,
}

/// One entry of the diagnostics listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheListing {
    pub cache_key: Option<String>,
    pub cache_version: Option<String>,
    pub scope: Option<String>,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReserveCacheRequest<'a> {
    key: &'a str,
    version: &'a str,
    cache_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveCacheResponse {
    cache_id: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CommitCacheRequest {
    size: u64,
}

/// HTTP backend against the cache service.
#[derive(Clone)]
pub struct RestBackend {
    client: Client,
    /// Archive locations are pre-signed; no service credential is sent there.
    downloader: RangedDownloader,
    service: ServiceConfig,
    retry: RetryExecutor,
}

impl RestBackend {
    pub fn new(service: ServiceConfig, retry: RetryExecutor) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let accept = format!("application/json;api-version={}", service.api_version);
        headers.insert(
            ACCEPT,
            HeaderValue::from_str(&accept)
                .map_err(|e| Error::Validation(format!("Invalid api version: {}", e)))?,
        );
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", service.token))
            .map_err(|e| Error::Validation(format!("Invalid cache token: {}", e)))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let request_timeout = Duration::from_secs(service.request_timeout_secs);
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        let download_client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            downloader: RangedDownloader::new(download_client, retry, request_timeout),
            service,
            retry,
        })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.request_timeout_secs)
    }

    /// Look up an entry for `keys` at `version`. `None` on a miss.
    pub async fn get_cache_entry(&self, keys: &[String], version: &str) -> Result<Option<CacheEntry>> {
        let url = self.service.resource_url("cache");
        let query = [("keys", keys.join(",")), ("version", version.to_string())];
        let (url, query) = (&url, &query);

        self.retry
            .execute("getCacheEntry", || async move {
                let response = self
                    .client
                    .get(url)
                    .query(query)
                    .timeout(self.request_timeout())
                    .send()
                    .await
                    .map_err(|e| transport("getCacheEntry", e))?;

                match response.status() {
                    StatusCode::NO_CONTENT => Ok(None),
                    status if status.is_success() => {
                        let entry: ArtifactCacheEntry = response
                            .json()
                            .await
                            .map_err(|e| transport("getCacheEntry", e))?;
                        let location = entry
                            .archive_location
                            .filter(|l| !l.is_empty())
                            .ok_or_else(|| {
                                Error::Inconsistency(
                                    "getCacheEntry: cache entry has no archive location".into(),
                                )
                            })?;
                        Ok(Some(CacheEntry {
                            key: entry
                                .cache_key
                                .or_else(|| keys.first().cloned())
                                .unwrap_or_default(),
                            scope: entry.scope,
                            created_at: entry.creation_time,
                            location,
                        }))
                    }
                    _ => Err(service_error("getCacheEntry", response).await),
                }
            })
            .await
    }

    /// Entries stored under `key` across all versions.
    pub async fn list_caches(&self, key: &str) -> Result<Vec<CacheListing>> {
        let url = self.service.resource_url("caches");
        let url = &url;

        self.retry
            .execute("listCaches", || async move {
                let response = self
                    .client
                    .get(url)
                    .query(&[("key", key)])
                    .timeout(self.request_timeout())
                    .send()
                    .await
                    .map_err(|e| transport("listCaches", e))?;

                if !response.status().is_success() {
                    return Err(service_error("listCaches", response).await);
                }
                let list: ArtifactCacheList = response
                    .json()
                    .await
                    .map_err(|e| transport("listCaches", e))?;
                Ok(list.artifact_caches)
            })
            .await
    }

    /// Reserve a write slot. A 409 means another job holds it and is never retried.
    pub async fn reserve_cache(&self, key: &str, version: &str, size_hint: Option<u64>) -> Result<ReserveResult> {
        let url = self.service.resource_url("caches");
        let body = ReserveCacheRequest {
            key,
            version,
            cache_size: size_hint,
        };
        let (url, body) = (&url, &body);

        self.retry
            .execute("reserveCache", || async move {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .timeout(self.request_timeout())
                    .send()
                    .await
                    .map_err(|e| transport("reserveCache", e))?;

                match response.status() {
                    StatusCode::CONFLICT => Err(Error::ReserveConflict {
                        key: key.to_string(),
                    }),
                    status if status.is_success() => {
                        let reserved: ReserveCacheResponse = response
                            .json()
                            .await
                            .map_err(|e| transport("reserveCache", e))?;
                        Ok(match reserved.cache_id {
                            Some(id) => ReserveResult::reserved(id),
                            None => ReserveResult {
                                cache_id: None,
                                success: false,
                            },
                        })
                    }
                    _ => Err(service_error("reserveCache", response).await),
                }
            })
            .await
    }

    /// Upload one byte range of a reserved cache.
    pub async fn upload_chunk(&self, cache_id: u64, file: &SharedFile, range: ChunkRange) -> Result<()> {
        let url = self.service.resource_url(&format!("caches/{}", cache_id));
        let data = file.read_range(range).await?;
        let (url, data) = (&url, &data);

        self.retry
            .execute("uploadChunk", || async move {
                debug!(cache_id, start = range.start, end = range.end, "uploading chunk");
                let response = self
                    .client
                    .patch(url)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_RANGE, range.content_range())
                    .body(data.clone())
                    .timeout(self.request_timeout())
                    .send()
                    .await
                    .map_err(|e| transport("uploadChunk", e))?;

                if !response.status().is_success() {
                    return Err(service_error("uploadChunk", response).await);
                }
                Ok(())
            })
            .await
    }

    /// Upload the whole archive in concurrent chunks.
    pub async fn upload_archive(
        &self,
        cache_id: u64,
        file: SharedFile,
        options: UploadOptions,
    ) -> Result<TransferSummary> {
        let backend = self.clone();
        TransferWorkerPool::new(options.concurrency)
            .run(file.len(), options.chunk_size, move |range| {
                let backend = backend.clone();
                let file = file.clone();
                async move { backend.upload_chunk(cache_id, &file, range).await }
            })
            .await
    }

    /// Finalize an upload so the entry becomes visible to lookups.
    pub async fn commit_cache(&self, cache_id: u64, size: u64) -> Result<()> {
        let url = self.service.resource_url(&format!("caches/{}", cache_id));
        let body = CommitCacheRequest { size };
        let (url, body) = (&url, &body);

        self.retry
            .execute("commitCache", || async move {
                let response = self
                    .client
                    .post(url)
                    .json(body)
                    .timeout(self.request_timeout())
                    .send()
                    .await
                    .map_err(|e| transport("commitCache", e))?;

                if !response.status().is_success() {
                    return Err(service_error("commitCache", response).await);
                }
                Ok(())
            })
            .await?;

        info!(cache_id, size, "cache committed");
        Ok(())
    }

    /// Download an archive location to `path`, returning the byte count.
    pub async fn download_archive(&self, location: &str, path: &Path, options: DownloadOptions) -> Result<u64> {
        let bytes = if options.concurrent {
            self.downloader
                .download_segmented(location, path, options.segment_size, options.concurrency)
                .await?
        } else {
            self.downloader.download_stream(location, path).await?
        };
        info!(bytes, "cache archive downloaded");
        Ok(bytes)
    }
}
