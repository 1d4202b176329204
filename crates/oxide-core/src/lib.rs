//! Oxide CI Core
//!
//! Core domain types and error handling for the Oxide CI artifact cache.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used by the cache engine.

pub mod cache;
pub mod error;

pub use cache::{CacheEntry, CompressionMethod, ReserveResult};
pub use error::{Error, Result};
