//! S3-compatible object store backend.
//!
//! Archives are stored under their cache key; there is no reserve or commit
//! step. Lookup lists the bucket page by page and resolves keys locally.

use crate::config::{ObjectStoreConfig, UploadOptions};
use crate::file::SharedFile;
use crate::pool::TransferWorkerPool;
use crate::resolver::{CacheEntryResolver, ListedEntry, ListingSource};
use crate::retry::RetryExecutor;
use async_trait::async_trait;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use chrono::{DateTime, Utc};
use oxide_core::{CacheEntry, Error, ReserveResult, Result};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// S3 caps a multipart upload at this many parts.
pub const MAX_PARTS: u64 = 10_000;

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<ListedEntry>,
    /// Token for the next page; `None` when the listing is complete.
    pub next_token: Option<String>,
}

/// Object store operations the cache needs.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn list_page(&self, continuation_token: Option<String>) -> Result<ObjectPage>;

    /// Start a multipart upload, returning its upload id.
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;

    /// Upload one part, returning its ETag.
    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, data: Vec<u8>) -> Result<String>;

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<(i32, String)>) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// Write the object at `key` to `path`, returning its size.
    async fn get_object(&self, key: &str, path: &Path) -> Result<u64>;
}

/// [`ObjectStore`] over the AWS SDK.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    max_keys: i32,
}

impl S3ObjectStore {
    pub fn new(config: &ObjectStoreConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            config.session_token.clone(),
            None,
            "oxide-cache",
        );
        // Retries are handled by RetryExecutor around every call.
        let mut builder = aws_sdk_s3::config::Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(config.force_path_style)
            .retry_config(RetryConfig::disabled());
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
            max_keys: config.max_keys,
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list_page(&self, continuation_token: Option<String>) -> Result<ObjectPage> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(self.max_keys)
            .set_continuation_token(continuation_token)
            .send()
            .await
            .map_err(|e| sdk_error("listObjects", e))?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                let last_modified = object
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()));
                Some(ListedEntry::new(object.key()?, last_modified))
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage { objects, next_token })
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("createMultipartUpload", e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Inconsistency("createMultipartUpload: response has no upload id".into()))
    }

    async fn upload_part(&self, key: &str, upload_id: &str, part_number: i32, data: Vec<u8>) -> Result<String> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| sdk_error("uploadPart", e))?;
        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| Error::Inconsistency(format!("uploadPart: part {} has no ETag", part_number)))
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<(i32, String)>) -> Result<()> {
        let parts = parts
            .into_iter()
            .map(|(part_number, e_tag)| {
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(e_tag)
                    .build()
            })
            .collect();
        let upload = CompletedMultipartUpload::builder()
            .set_parts(Some(parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(upload)
            .send()
            .await
            .map_err(|e| sdk_error("completeMultipartUpload", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| sdk_error("abortMultipartUpload", e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str, path: &Path) -> Result<u64> {
        let mut output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| sdk_error("getObject", e))?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(bytes) = output
            .body
            .try_next()
            .await
            .map_err(|e| Error::Transport(format!("getObject: {}", e)))?
        {
            file.write_all(&bytes).await?;
            written += bytes.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// Part size for `size` bytes, grown past `chunk_size` to stay within [`MAX_PARTS`].
fn part_size(size: u64, chunk_size: u64) -> u64 {
    chunk_size.max(size.div_ceil(MAX_PARTS)).max(1)
}

fn sdk_error<E>(operation: &str, err: SdkError<E>) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let context = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            Error::Transport(format!("{}: {}", operation, context))
        }
        _ => match err.raw_response() {
            Some(raw) => Error::Service {
                operation: operation.to_string(),
                status: raw.status().as_u16(),
                message: context,
            },
            None => Error::ObjectStore(format!("{}: {}", operation, context)),
        },
    }
}

/// Lazy, page-at-a-time listing of a bucket.
pub struct BucketListing<'a> {
    store: &'a dyn ObjectStore,
    retry: RetryExecutor,
    token: Option<String>,
    exhausted: bool,
}

impl<'a> BucketListing<'a> {
    pub fn new(store: &'a dyn ObjectStore, retry: RetryExecutor) -> Self {
        Self {
            store,
            retry,
            token: None,
            exhausted: false,
        }
    }
}

#[async_trait]
impl ListingSource for BucketListing<'_> {
    async fn next_page(&mut self) -> Result<Option<Vec<ListedEntry>>> {
        if self.exhausted {
            return Ok(None);
        }

        let store = self.store;
        let token = self.token.clone();
        let token = &token;
        let page = self
            .retry
            .execute("listObjects", || async move { store.list_page(token.clone()).await })
            .await?;

        self.exhausted = page.next_token.is_none();
        self.token = page.next_token;
        Ok(Some(page.objects))
    }
}

/// Cache backend keyed directly by object name.
#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    retry: RetryExecutor,
    resolver: CacheEntryResolver,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, retry: RetryExecutor) -> Self {
        Self {
            store,
            retry,
            resolver: CacheEntryResolver::new(),
        }
    }

    /// Resolve `keys` against the bucket contents.
    pub async fn lookup(&self, keys: &[String]) -> Result<Option<CacheEntry>> {
        let mut listing = BucketListing::new(self.store.as_ref(), self.retry);
        self.resolver.resolve_paginated(keys, &mut listing).await
    }

    /// The object key is the identity, so there is nothing to reserve.
    pub fn reserve(&self) -> ReserveResult {
        ReserveResult::keyed()
    }

    /// Multipart upload of `file` under `key`.
    pub async fn upload(&self, key: &str, file: SharedFile, options: UploadOptions) -> Result<u64> {
        let size = file.len();
        if size == 0 {
            return Err(Error::Validation("cannot upload an empty archive".into()));
        }
        let part_size = part_size(size, options.chunk_size);

        let store = self.store.clone();
        let upload_id = self
            .retry
            .execute("createMultipartUpload", || {
                let store = store.clone();
                async move { store.create_multipart_upload(key).await }
            })
            .await?;
        debug!(key, upload_id = %upload_id, part_size, "multipart upload started");

        let parts = Arc::new(Mutex::new(Vec::new()));
        let result = self
            .upload_parts(key, &upload_id, file, part_size, options.concurrency, parts.clone())
            .await;

        if let Err(e) = result {
            let abort = self
                .retry
                .execute("abortMultipartUpload", || {
                    let store = store.clone();
                    let upload_id = upload_id.clone();
                    async move { store.abort_multipart_upload(key, &upload_id).await }
                })
                .await;
            if let Err(abort_err) = abort {
                warn!(key, error = %abort_err, "failed to abort multipart upload");
            }
            return Err(e);
        }

        let mut parts = std::mem::take(&mut *parts.lock().map_err(|_| {
            Error::Internal("multipart part list poisoned".into())
        })?);
        parts.sort_by_key(|(part_number, _)| *part_number);

        let (upload_id, parts) = (&upload_id, &parts);
        self.retry
            .execute("completeMultipartUpload", || {
                let store = store.clone();
                async move {
                    store
                        .complete_multipart_upload(key, upload_id, parts.clone())
                        .await
                }
            })
            .await?;

        info!(key, size, parts = parts.len(), "cache archive uploaded to object store");
        Ok(size)
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        file: SharedFile,
        part_size: u64,
        concurrency: usize,
        parts: Arc<Mutex<Vec<(i32, String)>>>,
    ) -> Result<()> {
        let store = self.store.clone();
        let retry = self.retry;
        let key = key.to_string();
        let upload_id = upload_id.to_string();

        TransferWorkerPool::new(concurrency)
            .run(file.len(), part_size, move |range| {
                let store = store.clone();
                let file = file.clone();
                let key = key.clone();
                let upload_id = upload_id.clone();
                let parts = parts.clone();
                async move {
                    let part_number = i32::try_from(range.start / part_size + 1)
                        .map_err(|_| Error::Validation("too many multipart parts".into()))?;
                    let data = file.read_range(range).await?;
                    let (key, upload_id, data) = (&key, &upload_id, &data);
                    let e_tag = retry
                        .execute("uploadPart", || {
                            let store = store.clone();
                            async move {
                                store
                                    .upload_part(key, upload_id, part_number, data.clone())
                                    .await
                            }
                        })
                        .await?;
                    parts
                        .lock()
                        .map_err(|_| Error::Internal("multipart part list poisoned".into()))?
                        .push((part_number, e_tag));
                    Ok(())
                }
            })
            .await
            .map(|_| ())
    }

    /// Download the object named by the entry's location.
    pub async fn download(&self, entry: &CacheEntry, path: &Path) -> Result<u64> {
        let store = self.store.clone();
        let key = entry.location.as_str();
        let bytes = self
            .retry
            .execute("getObject", || {
                let store = store.clone();
                async move { store.get_object(key, path).await }
            })
            .await?;
        info!(key, bytes, "cache archive downloaded from object store");
        Ok(bytes)
    }
}
