//! Cache key validation and version fingerprinting.

use oxide_core::{CompressionMethod, Error, Result};
use sha2::{Digest, Sha256};

/// Maximum number of keys (primary plus restore keys) per lookup.
pub const MAX_KEYS: usize = 10;
/// Maximum length of a single key in bytes.
pub const MAX_KEY_LENGTH: usize = 512;

const VERSION_SALT: &str = "1.0";

/// Compute the cache version for a set of paths.
///
/// The version binds an entry to the paths it was built from and the archive
/// format, so a lookup with identical keys but a different layout misses.
pub fn cache_version(paths: &[String], compression: CompressionMethod, cross_os: bool) -> String {
    let mut components: Vec<&str> = paths.iter().map(String::as_str).collect();

    // Gzip archives predate the compression component.
    if compression != CompressionMethod::Gzip {
        components.push(compression.as_str());
    }

    if cfg!(windows) && !cross_os {
        components.push("windows-only");
    }

    components.push(VERSION_SALT);

    let hash = Sha256::digest(components.join("|").as_bytes());
    hex::encode(hash)
}

/// Validate an ordered key list: primary first, restore keys after.
pub fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::Validation("at least one cache key is required".into()));
    }
    if keys.len() > MAX_KEYS {
        return Err(Error::Validation(format!(
            "key validation failed: keys are limited to {} (got {})",
            MAX_KEYS,
            keys.len()
        )));
    }
    for key in keys {
        validate_key(key)?;
    }
    Ok(())
}

/// Validate a single key.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Validation("cache key cannot be empty".into()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(Error::Validation(format!(
            "key validation failed: {} cannot be larger than {} characters",
            key, MAX_KEY_LENGTH
        )));
    }
    if key.contains(',') {
        return Err(Error::Validation(format!(
            "key validation failed: {} cannot contain commas",
            key
        )));
    }
    Ok(())
}

/// Check if a key matches a prefix pattern.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}
