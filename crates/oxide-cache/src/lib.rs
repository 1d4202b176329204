//! Artifact cache transfers for Oxide CI.
//!
//! A [`CacheSession`] resolves keys to a stored entry, downloads it, or
//! reserves, uploads and commits a new archive through one of three
//! backends: the cache REST service, blob storage behind that service, or
//! an S3-compatible bucket.

pub mod backend;
pub mod chunk;
pub mod config;
pub mod file;
pub mod keys;
pub mod pool;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod types;

pub use backend::{Backend, BackendKind};
pub use chunk::{ChunkPlan, ChunkRange};
pub use config::{BlobConfig, CacheConfig, DownloadOptions, ObjectStoreConfig, ServiceConfig, UploadOptions};
pub use keys::{cache_version, matches_prefix, validate_key, validate_keys};
pub use pool::{TransferSummary, TransferWorkerPool};
pub use resolver::{CacheEntryResolver, ListedEntry, ListingSource};
pub use retry::{RetryExecutor, RetryPolicy};
pub use session::{CacheSession, RestoreState, SaveState};
pub use types::{
    CacheRestoreRequest, CacheSaveRequest, CacheStats, ProgressFn, RestoreResult, SaveResult,
    TransferProgress,
};
