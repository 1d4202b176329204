//! Error types for Oxide CI.

use thiserror::Error;

/// HTTP statuses that indicate a transient fault on the cache service.
pub const RETRYABLE_STATUS_CODES: [u16; 6] = [408, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum Error {
    // Input errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Cache errors
    #[error("Unable to reserve cache with key {key}, another job may be creating this cache")]
    ReserveConflict { key: String },

    #[error("{operation}: cache service returned {status}: {message}")]
    Service {
        operation: String,
        status: u16,
        message: String,
    },

    #[error("Inconsistent cache service response: {0}")]
    Inconsistency(String),

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Blob {operation} failed: {source}")]
    BlobTransfer {
        operation: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Object store error: {0}")]
    ObjectStore(String),

    // Infrastructure errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the failure is transient and the call may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Service { status, .. } => RETRYABLE_STATUS_CODES.contains(status),
            _ => false,
        }
    }

    /// Whether another writer already holds the reservation.
    pub fn is_reserve_conflict(&self) -> bool {
        match self {
            Error::ReserveConflict { .. } => true,
            Error::RetriesExhausted { source, .. } => source.is_reserve_conflict(),
            _ => false,
        }
    }

    /// The innermost error, skipping retry and blob transfer wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::RetriesExhausted { source, .. } | Error::BlobTransfer { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
