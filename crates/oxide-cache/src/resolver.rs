//! Matching of lookup keys against stored entries.
//!
//! The primary key (index 0) must match exactly and always wins. Restore
//! keys are consulted in caller order; for each one an exact match is
//! preferred, otherwise the newest entry whose key starts with it. The first
//! restore key with any match decides the result.

use crate::keys::matches_prefix;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oxide_core::{CacheEntry, Result};
use tracing::debug;

/// One stored object as reported by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

impl ListedEntry {
    pub fn new(key: impl Into<String>, last_modified: Option<DateTime<Utc>>) -> Self {
        Self {
            key: key.into(),
            last_modified,
        }
    }

    fn into_entry(self) -> CacheEntry {
        CacheEntry {
            location: self.key.clone(),
            key: self.key,
            scope: None,
            created_at: self.last_modified,
        }
    }
}

/// A listing delivered one page at a time.
///
/// The resolver stops pulling pages once the primary key is found, so
/// sources should fetch lazily.
#[async_trait]
pub trait ListingSource: Send {
    /// The next page, or `None` once the listing is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<ListedEntry>>>;
}

/// Resolves lookup keys against a listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheEntryResolver;

impl CacheEntryResolver {
    pub fn new() -> Self {
        Self
    }

    /// Pick the best entry for `keys` out of a complete listing.
    ///
    /// Timestamp ties between prefix matches go to the entry listed first;
    /// entries without a timestamp rank below any dated entry.
    pub fn resolve(&self, keys: &[String], listing: &[ListedEntry]) -> Option<CacheEntry> {
        let (primary, restore_keys) = keys.split_first()?;

        if let Some(hit) = listing.iter().find(|e| &e.key == primary) {
            return Some(hit.clone().into_entry());
        }

        for restore_key in restore_keys {
            if let Some(hit) = listing.iter().find(|e| &e.key == restore_key) {
                return Some(hit.clone().into_entry());
            }

            let mut newest: Option<&ListedEntry> = None;
            for candidate in listing.iter().filter(|e| matches_prefix(&e.key, restore_key)) {
                match newest {
                    Some(current) if candidate.last_modified <= current.last_modified => {}
                    _ => newest = Some(candidate),
                }
            }

            if let Some(hit) = newest {
                debug!(restore_key = %restore_key, matched = %hit.key, "restore key matched");
                return Some(hit.clone().into_entry());
            }
        }

        None
    }

    /// Drain `source` and resolve over everything it listed.
    ///
    /// Stops paging as soon as a page contains the primary key.
    pub async fn resolve_paginated<S>(&self, keys: &[String], source: &mut S) -> Result<Option<CacheEntry>>
    where
        S: ListingSource + ?Sized,
    {
        let Some(primary) = keys.first() else {
            return Ok(None);
        };

        let mut listing = Vec::new();
        let mut pages = 0usize;
        while let Some(page) = source.next_page().await? {
            pages += 1;
            if let Some(hit) = page.iter().find(|e| &e.key == primary) {
                debug!(key = %primary, pages, "primary key found, stopping listing");
                return Ok(Some(hit.clone().into_entry()));
            }
            listing.extend(page);
        }

        debug!(pages, objects = listing.len(), "listing drained");
        Ok(self.resolve(keys, &listing))
    }
}
