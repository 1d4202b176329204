//! Blob storage transfers through signed URLs.
//!
//! [`BlobTransfer`] is the SDK seam: one call moves a whole archive and the
//! implementation owns chunking, concurrency and retries. [`SasBlobClient`]
//! speaks the block blob REST protocol (Put Block / Put Block List) against a
//! shared-access-signature URL.

use super::ranged::{RangedDownloader, service_error, transport};
use super::rest::RestBackend;
use crate::config::BlobConfig;
use crate::file::SharedFile;
use crate::pool::TransferWorkerPool;
use crate::retry::RetryExecutor;
use crate::types::{ProgressFn, TransferProgress};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use oxide_core::{CacheEntry, Error, ReserveResult, Result};
use reqwest::Client;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const BLOB_API_VERSION: &str = "2021-08-06";

/// Whole-file transfer to and from blob storage.
#[async_trait]
pub trait BlobTransfer: Send + Sync {
    /// Upload the file at `path` to `url`, returning bytes sent.
    async fn upload_file(&self, url: &str, path: &Path, progress: ProgressFn) -> Result<u64>;

    /// Download `url` into `path`, returning bytes received.
    async fn download_to_file(&self, url: &str, path: &Path, progress: ProgressFn) -> Result<u64>;
}

/// Block blob client for signed URLs.
#[derive(Clone)]
pub struct SasBlobClient {
    client: Client,
    retry: RetryExecutor,
    request_timeout: Duration,
    block_size: u64,
    concurrency: usize,
}

impl SasBlobClient {
    pub fn new(config: &BlobConfig, retry: RetryExecutor) -> Result<Self> {
        let request_timeout = Duration::from_secs(config.request_timeout_secs);
        let client = Client::builder()
            .user_agent(concat!("oxide-cache/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(request_timeout)
            .read_timeout(request_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            retry,
            request_timeout,
            block_size: config.block_size.max(1),
            concurrency: config.concurrency.max(1),
        })
    }

    /// Fixed-width block id for a block index, as the service requires.
    fn block_id(index: u64) -> String {
        STANDARD.encode(format!("block-{:012}", index))
    }

    fn with_query(url: &str, pairs: &[(&str, &str)]) -> Result<String> {
        let mut url = Url::parse(url)
            .map_err(|e| Error::Validation(format!("Invalid blob URL: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            for (k, v) in pairs {
                query.append_pair(k, v);
            }
        }
        Ok(url.to_string())
    }

    async fn put_block(&self, url: &str, index: u64, data: Vec<u8>) -> Result<()> {
        let block_url = Self::with_query(url, &[("comp", "block"), ("blockid", &Self::block_id(index))])?;
        let (block_url, data) = (&block_url, &data);

        self.retry
            .execute("putBlock", || async move {
                let response = self
                    .client
                    .put(block_url)
                    .header("x-ms-version", BLOB_API_VERSION)
                    .body(data.clone())
                    .timeout(self.request_timeout)
                    .send()
                    .await
                    .map_err(|e| transport("putBlock", e))?;
                if !response.status().is_success() {
                    return Err(service_error("putBlock", response).await);
                }
                Ok(())
            })
            .await
    }

    async fn put_block_list(&self, url: &str, blocks: u64) -> Result<()> {
        let list_url = Self::with_query(url, &[("comp", "blocklist")])?;
        let mut body = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?><BlockList>");
        for index in 0..blocks {
            body.push_str("<Latest>");
            body.push_str(&Self::block_id(index));
            body.push_str("</Latest>");
        }
        body.push_str("</BlockList>");
        let (list_url, body) = (&list_url, &body);

        self.retry
            .execute("putBlockList", || async move {
                let response = self
                    .client
                    .put(list_url)
                    .header("x-ms-version", BLOB_API_VERSION)
                    .header("content-type", "application/xml")
                    .body(body.clone())
                    .timeout(self.request_timeout)
                    .send()
                    .await
                    .map_err(|e| transport("putBlockList", e))?;
                if !response.status().is_success() {
                    return Err(service_error("putBlockList", response).await);
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl BlobTransfer for SasBlobClient {
    async fn upload_file(&self, url: &str, path: &Path, progress: ProgressFn) -> Result<u64> {
        let file = SharedFile::open(path).await?;
        let total = file.len();
        let block_size = self.block_size;
        let client = self.clone();
        let block_url = url.to_string();

        let summary = TransferWorkerPool::new(self.concurrency)
            .with_progress(progress)
            .run(total, block_size, move |range| {
                let client = client.clone();
                let file = file.clone();
                let url = block_url.clone();
                async move {
                    let data = file.read_range(range).await?;
                    client.put_block(&url, range.start / block_size, data).await
                }
            })
            .await?;

        self.put_block_list(url, summary.chunks).await?;
        Ok(summary.bytes)
    }

    async fn download_to_file(&self, url: &str, path: &Path, progress: ProgressFn) -> Result<u64> {
        let bytes = RangedDownloader::new(self.client.clone(), self.retry, self.request_timeout)
            .with_progress(progress.clone())
            .download_segmented(url, path, self.block_size, self.concurrency)
            .await?;
        progress(TransferProgress {
            transferred: bytes,
            total: bytes,
        });
        Ok(bytes)
    }
}

/// Cache service for metadata, blob storage for archive bytes.
#[derive(Clone)]
pub struct BlobStoreBackend {
    service: RestBackend,
    blob: Arc<dyn BlobTransfer>,
    upload_url: Option<String>,
}

impl BlobStoreBackend {
    pub fn new(service: RestBackend, blob: Arc<dyn BlobTransfer>, config: &BlobConfig) -> Self {
        Self {
            service,
            blob,
            upload_url: config.upload_url.clone(),
        }
    }

    pub fn service(&self) -> &RestBackend {
        &self.service
    }

    pub async fn lookup(&self, keys: &[String], version: &str) -> Result<Option<CacheEntry>> {
        self.service.get_cache_entry(keys, version).await
    }

    pub async fn reserve(&self, key: &str, version: &str, size_hint: Option<u64>) -> Result<ReserveResult> {
        self.service.reserve_cache(key, version, size_hint).await
    }

    /// Upload the archive to the configured signed URL.
    pub async fn upload(&self, path: &Path) -> Result<u64> {
        let url = self
            .upload_url
            .as_deref()
            .ok_or_else(|| Error::Validation("blob upload requires a signed upload URL".into()))?;
        self.blob
            .upload_file(url, path, log_progress("upload"))
            .await
            .map_err(|e| Error::BlobTransfer {
                operation: "upload".into(),
                source: Box::new(e),
            })
    }

    pub async fn commit(&self, cache_id: u64, size: u64) -> Result<()> {
        self.service.commit_cache(cache_id, size).await
    }

    /// Download an entry whose location is a signed blob URL.
    pub async fn download(&self, entry: &CacheEntry, path: &Path) -> Result<u64> {
        let bytes = self
            .blob
            .download_to_file(&entry.location, path, log_progress("download"))
            .await
            .map_err(|e| Error::BlobTransfer {
                operation: "download".into(),
                source: Box::new(e),
            })?;
        info!(key = %entry.key, bytes, "cache archive downloaded from blob storage");
        Ok(bytes)
    }
}

fn log_progress(direction: &'static str) -> ProgressFn {
    Arc::new(move |progress: TransferProgress| {
        debug!(
            direction,
            transferred = progress.transferred,
            total = progress.total,
            percent = progress.percent(),
            "blob transfer progress"
        );
    })
}
