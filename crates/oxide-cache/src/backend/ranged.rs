//! Streamed and range-segmented GET downloads to a local file.

use crate::chunk::ChunkRange;
use crate::file::SharedFile;
use crate::pool::TransferWorkerPool;
use crate::retry::RetryExecutor;
use crate::types::ProgressFn;
use oxide_core::{Error, Result};
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Downloads a URL, either as one stream or as concurrent ranged segments.
///
/// Size lookups and segments are bounded by `request_timeout` per call. A
/// streamed body can outlive it, so the client passed in should carry a
/// read timeout to turn a stalled stream into a transport fault.
#[derive(Clone)]
pub struct RangedDownloader {
    client: Client,
    retry: RetryExecutor,
    request_timeout: Duration,
    progress: Option<ProgressFn>,
}

impl RangedDownloader {
    pub fn new(client: Client, retry: RetryExecutor, request_timeout: Duration) -> Self {
        Self {
            client,
            retry,
            request_timeout,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Download with `concurrency` workers fetching `segment_size` ranges.
    ///
    /// Falls back to a single stream when the server does not honor ranges.
    pub async fn download_segmented(
        &self,
        url: &str,
        path: &Path,
        segment_size: u64,
        concurrency: usize,
    ) -> Result<u64> {
        let Some(total) = self.probe_size(url).await? else {
            debug!("server ignored range request, falling back to a single stream");
            return self.download_stream(url, path).await;
        };

        let file = SharedFile::create(path, total).await?;
        let downloader = self.clone();
        let url = url.to_string();
        let target = file.clone();

        let mut pool = TransferWorkerPool::new(concurrency);
        if let Some(progress) = &self.progress {
            pool = pool.with_progress(progress.clone());
        }
        let summary = pool
            .run(total, segment_size, move |range| {
                let downloader = downloader.clone();
                let url = url.clone();
                let file = target.clone();
                async move { downloader.download_segment(&url, &file, range).await }
            })
            .await?;

        file.sync().await?;
        Ok(summary.bytes)
    }

    /// Download as a single GET, validated against `Content-Length`.
    pub async fn download_stream(&self, url: &str, path: &Path) -> Result<u64> {
        self.retry
            .execute("downloadCache", || async move {
                let mut response = self
                    .client
                    .get(url)
                    .send()
                    .await
                    .map_err(|e| transport("downloadCache", e))?;
                if !response.status().is_success() {
                    return Err(service_error("downloadCache", response).await);
                }

                let expected = response.content_length();
                let mut file = tokio::fs::File::create(path).await?;
                let mut written = 0u64;
                while let Some(chunk) = response
                    .chunk()
                    .await
                    .map_err(|e| transport("downloadCache", e))?
                {
                    file.write_all(&chunk).await?;
                    written += chunk.len() as u64;
                }
                file.flush().await?;

                if let Some(expected) = expected {
                    if expected != written {
                        return Err(Error::Transport(format!(
                            "Incomplete download. Expected file size: {}, actual file size: {}",
                            expected, written
                        )));
                    }
                }
                Ok(written)
            })
            .await
    }

    /// Total size from a one-byte ranged GET, `None` if ranges are unsupported.
    async fn probe_size(&self, url: &str) -> Result<Option<u64>> {
        self.retry
            .execute("probeCacheSize", || async move {
                let response = self
                    .client
                    .get(url)
                    .header(RANGE, ChunkRange::new(0, 0).range_header())
                    .timeout(self.request_timeout)
                    .send()
                    .await
                    .map_err(|e| transport("probeCacheSize", e))?;

                match response.status() {
                    StatusCode::PARTIAL_CONTENT => Ok(response
                        .headers()
                        .get(CONTENT_RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_total_size)),
                    StatusCode::RANGE_NOT_SATISFIABLE => Ok(None),
                    status if status.is_success() => Ok(None),
                    _ => Err(service_error("probeCacheSize", response).await),
                }
            })
            .await
    }

    async fn download_segment(&self, url: &str, file: &SharedFile, range: ChunkRange) -> Result<()> {
        let data = self
            .retry
            .execute("downloadCacheSegment", || async move {
                let response = self
                    .client
                    .get(url)
                    .header(RANGE, range.range_header())
                    .timeout(self.request_timeout)
                    .send()
                    .await
                    .map_err(|e| transport("downloadCacheSegment", e))?;

                match response.status() {
                    StatusCode::PARTIAL_CONTENT => {}
                    status if status.is_success() => {
                        return Err(Error::Transport(format!(
                            "Expected partial content for {}, got {}",
                            range.range_header(),
                            status
                        )));
                    }
                    _ => return Err(service_error("downloadCacheSegment", response).await),
                }

                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| transport("downloadCacheSegment", e))?;
                if bytes.len() as u64 != range.size() {
                    return Err(Error::Transport(format!(
                        "Segment {} returned {} bytes",
                        range.range_header(),
                        bytes.len()
                    )));
                }
                Ok(bytes)
            })
            .await?;

        file.write_at(range.start, data.to_vec()).await
    }
}

/// Total size from a `Content-Range: bytes a-b/total` value.
pub(crate) fn parse_total_size(content_range: &str) -> Option<u64> {
    content_range.rsplit('/').next()?.trim().parse().ok()
}

/// Map a reqwest failure: body decode problems are serialization errors,
/// everything else is a transport fault.
pub(crate) fn transport(operation: &str, err: reqwest::Error) -> Error {
    if err.is_decode() {
        Error::Serialization(format!("{}: {}", operation, err))
    } else {
        Error::Transport(format!("{}: {}", operation, err))
    }
}

/// Consume a non-2xx response into [`Error::Service`] tagged with `operation`.
pub(crate) async fn service_error(operation: &str, response: Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::Service {
        operation: operation.to_string(),
        status: status.as_u16(),
        message: if body.is_empty() {
            status.to_string()
        } else {
            body
        },
    }
}
