//! Retry with geometric backoff around fallible network calls.

use oxide_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Attempt budget and backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_interval")]
    pub initial_interval_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_interval() -> u64 {
    3000
}

fn default_backoff_multiplier() -> f64 {
    1.5
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_interval_ms: default_initial_interval(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval_ms: u64, backoff_multiplier: f64) -> Self {
        Self {
            max_attempts,
            initial_interval_ms,
            backoff_multiplier,
        }
    }

    /// Wait before retry number `retry` (0 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry as i32);
        Duration::from_millis((self.initial_interval_ms as f64 * factor).round() as u64)
    }
}

/// Runs an operation under a [`RetryPolicy`].
#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute `op`, retrying errors for which [`Error::is_retryable`] holds.
    pub async fn execute<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with(name, Error::is_retryable, op).await
    }

    /// Execute `op`, retrying errors accepted by `is_retryable`.
    ///
    /// Fatal errors are returned unchanged. When the attempt budget runs out
    /// the last error is wrapped in [`Error::RetriesExhausted`] carrying `name`.
    pub async fn execute_with<T, F, Fut, P>(&self, name: &str, is_retryable: P, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation = name, attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if !is_retryable(&e) => return Err(e),
                Err(e) if attempt >= max_attempts => {
                    return Err(Error::RetriesExhausted {
                        operation: name.to_string(),
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    let backoff = self.policy.backoff(attempt - 1);
                    warn!(
                        operation = name,
                        error = %e,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryExecutor {
        RetryExecutor::new(RetryPolicy::new(max_attempts, 1, 2.0))
    }

    fn unavailable() -> Error {
        Error::Service {
            operation: "getCacheEntry".into(),
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn test_backoff_grows_geometrically() {
        let policy = RetryPolicy::new(5, 100, 2.0);
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = fast(3)
            .execute("uploadChunk", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(unavailable())
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_tags_operation_name() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = fast(3)
            .execute("uploadChunk", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(unavailable()) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::RetriesExhausted {
                operation,
                attempts,
                source,
            }) => {
                assert_eq!(operation, "uploadChunk");
                assert_eq!(attempts, 3);
                assert!(matches!(*source, Error::Service { status: 503, .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_errors_escape_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = fast(5)
            .execute("reserveCache", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::ReserveConflict {
                        key: "build-42".into(),
                    })
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::ReserveConflict { .. })));
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let calls = AtomicU32::new(0);

        let result: Result<()> = fast(4)
            .execute_with(
                "probe",
                |_| false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::Transport("reset".into())) }
                },
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
