//! Bounded pool of workers draining a shared chunk cursor.

use crate::chunk::{self, ChunkRange};
use crate::types::{ProgressFn, TransferProgress};
use oxide_core::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::task::JoinSet;
use tracing::debug;

/// Totals reported by a successful [`TransferWorkerPool::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSummary {
    pub bytes: u64,
    pub chunks: u64,
}

/// Runs chunk transfers on up to `concurrency` parallel workers.
///
/// Workers claim ranges from one atomic cursor, so faster workers pick up
/// more chunks. The first failing chunk stops further claims; chunks already
/// in flight run to completion and the first error is returned.
#[derive(Clone)]
pub struct TransferWorkerPool {
    concurrency: usize,
    progress: Option<ProgressFn>,
}

impl TransferWorkerPool {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub async fn run<F, Fut>(&self, total_size: u64, chunk_size: u64, transfer: F) -> Result<TransferSummary>
    where
        F: Fn(ChunkRange) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let plan = chunk::plan(total_size, chunk_size, self.concurrency);
        let cursor = Arc::new(plan.cursor());
        let failed = Arc::new(AtomicBool::new(false));
        let first_error = Arc::new(OnceLock::new());
        let transferred = Arc::new(AtomicU64::new(0));
        let chunks = Arc::new(AtomicU64::new(0));
        let transfer = Arc::new(transfer);

        debug!(
            total_size,
            chunk_size = plan.chunk_size(),
            chunk_count = plan.chunk_count(),
            workers = plan.workers(),
            "starting transfer"
        );

        let mut workers = JoinSet::new();
        for worker in 0..plan.workers() {
            let cursor = cursor.clone();
            let failed = failed.clone();
            let first_error = first_error.clone();
            let transferred = transferred.clone();
            let chunks = chunks.clone();
            let transfer = transfer.clone();
            let progress = self.progress.clone();

            workers.spawn(async move {
                while !failed.load(Ordering::Acquire) {
                    let Some(range) = cursor.claim() else {
                        break;
                    };
                    debug!(worker, start = range.start, end = range.end, "transferring chunk");

                    if let Err(e) = transfer(range).await {
                        record_failure(&failed, &first_error, e);
                        return;
                    }

                    let done = transferred.fetch_add(range.size(), Ordering::AcqRel) + range.size();
                    chunks.fetch_add(1, Ordering::Relaxed);
                    if let Some(progress) = &progress {
                        progress(TransferProgress {
                            transferred: done,
                            total: total_size,
                        });
                    }
                }
            });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                record_failure(
                    &failed,
                    &first_error,
                    Error::Internal(format!("Transfer worker panicked: {}", e)),
                );
            }
        }

        if failed.load(Ordering::Acquire) {
            return Err(Arc::into_inner(first_error)
                .and_then(OnceLock::into_inner)
                .unwrap_or_else(|| Error::Internal("transfer failed without a recorded error".into())));
        }

        Ok(TransferSummary {
            bytes: transferred.load(Ordering::Acquire),
            chunks: chunks.load(Ordering::Acquire),
        })
    }
}

/// Only the worker that raises `failed` records its error.
fn record_failure(failed: &AtomicBool, first_error: &OnceLock<Error>, err: Error) {
    if !failed.swap(true, Ordering::AcqRel) {
        let _ = first_error.set(err);
    }
}
