//! Configuration for cache transfers.
//!
//! Which optional section is present decides the backend for a call; see
//! [`crate::backend::BackendKind::select`].

use crate::retry::RetryPolicy;
use oxide_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIB: u64 = 1024 * 1024;

/// Cache transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache REST service. Required by the Rest and BlobStore backends.
    #[serde(default)]
    pub service: Option<ServiceConfig>,
    /// Route archive bytes through the blob SDK.
    #[serde(default)]
    pub blob: Option<BlobConfig>,
    /// S3-compatible object store; takes the place of the cache service.
    #[serde(default)]
    pub object_store: Option<ObjectStoreConfig>,
    #[serde(default)]
    pub upload: UploadOptions,
    #[serde(default)]
    pub download: DownloadOptions,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl CacheConfig {
    /// Config targeting the cache REST service.
    pub fn rest(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            service: Some(ServiceConfig::new(base_url, token)),
            ..Default::default()
        }
    }

    /// Config targeting an S3-compatible bucket.
    pub fn object_store(config: ObjectStoreConfig) -> Self {
        Self {
            object_store: Some(config),
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)
            .map_err(|e| Error::Serialization(format!("Invalid cache config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_blob(mut self, blob: BlobConfig) -> Self {
        self.blob = Some(blob);
        self
    }

    pub fn with_upload(mut self, upload: UploadOptions) -> Self {
        self.upload = upload;
        self
    }

    pub fn with_download(mut self, download: DownloadOptions) -> Self {
        self.download = download;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject option values no transfer can run with.
    pub fn validate(&self) -> Result<()> {
        if self.upload.concurrency == 0 || self.download.concurrency == 0 {
            return Err(Error::Validation("concurrency must be at least 1".into()));
        }
        if self.upload.chunk_size == 0 || self.download.segment_size == 0 {
            return Err(Error::Validation("chunk size must be at least 1 byte".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Validation("max_attempts must be at least 1".into()));
        }
        if let Some(blob) = &self.blob {
            if blob.block_size == 0 || blob.concurrency == 0 {
                return Err(Error::Validation(
                    "blob block size and concurrency must be at least 1".into(),
                ));
            }
        }
        if let Some(store) = &self.object_store {
            if store.bucket.is_empty() {
                return Err(Error::Validation("object store bucket is required".into()));
            }
        }
        Ok(())
    }
}

/// Cache REST service endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service root, e.g. `https://cache.example.com/`.
    pub base_url: String,
    /// Bearer credential sent on every request.
    pub token: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_api_version() -> String {
    "6.0-preview.1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

impl ServiceConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            api_version: default_api_version(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    /// URL of a resource under the artifact cache API.
    pub fn resource_url(&self, resource: &str) -> String {
        format!(
            "{}/_apis/artifactcache/{}",
            self.base_url.trim_end_matches('/'),
            resource
        )
    }
}

/// Blob SDK transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobConfig {
    /// Signed URL the archive is uploaded to.
    #[serde(default)]
    pub upload_url: Option<String>,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    #[serde(default = "default_blob_concurrency")]
    pub concurrency: usize,
    /// Bound on each block request and on idle reads while downloading.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_block_size() -> u64 {
    4 * MIB
}

fn default_blob_concurrency() -> usize {
    8
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            upload_url: None,
            block_size: default_block_size(),
            concurrency: default_blob_concurrency(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl BlobConfig {
    pub fn with_upload_url(mut self, url: impl Into<String>) -> Self {
        self.upload_url = Some(url.into());
        self
    }
}

/// S3-compatible bucket holding archives under their cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for MinIO, R2 and friends.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default = "default_force_path_style")]
    pub force_path_style: bool,
    /// Page size for bucket listing.
    #[serde(default = "default_max_keys")]
    pub max_keys: i32,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_force_path_style() -> bool {
    true
}

fn default_max_keys() -> i32 {
    1000
}

impl ObjectStoreConfig {
    pub fn new(
        bucket: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            region: default_region(),
            endpoint: None,
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
            force_path_style: default_force_path_style(),
            max_keys: default_max_keys(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }
}

/// Upload tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UploadOptions {
    #[serde(default = "default_upload_concurrency")]
    pub concurrency: usize,
    /// Bytes per PATCH request or multipart part.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_chunk_size() -> u64 {
    32 * MIB
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            concurrency: default_upload_concurrency(),
            chunk_size: default_chunk_size(),
        }
    }
}

/// Download tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DownloadOptions {
    /// Fetch the archive with concurrent ranged GETs.
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default = "default_download_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    /// Resolve the entry without downloading it.
    #[serde(default)]
    pub lookup_only: bool,
}

fn default_download_concurrency() -> usize {
    8
}

fn default_segment_size() -> u64 {
    4 * MIB
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrent: false,
            concurrency: default_download_concurrency(),
            segment_size: default_segment_size(),
            lookup_only: false,
        }
    }
}
