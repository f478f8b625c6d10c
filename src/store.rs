//! KvStore trait - the boundary to the backing key-value stores.
//!
//! Keys are hierarchical, path-like strings (`/netstate/v1/network/<id>`).
//! Every successful write is stamped with a version drawn from a store-wide
//! revision counter, so versions only ever grow, across keys as well as
//! within one key. Writes and deletes are conditional on the version the
//! caller last observed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::error::{Result, StateError};
use crate::watch::WatchStream;

/// Maximum key length in bytes.
pub const MAX_KEY_LENGTH: usize = 1024;

/// Root chain every object key lives under.
pub const ROOT_CHAIN: [&str; 2] = ["netstate", "v1"];

/// Collection segment for networks.
pub const NETWORK_KEY_PREFIX: &str = "network";

/// Collection segment for endpoints.
pub const ENDPOINT_KEY_PREFIX: &str = "endpoint";

/// Build a full store key from object key segments.
///
/// `key(&["network", "n1"])` yields `/netstate/v1/network/n1`.
pub fn key<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = String::new();
    for root in ROOT_CHAIN {
        out.push('/');
        out.push_str(root);
    }
    for segment in segments {
        out.push('/');
        out.push_str(segment.as_ref().trim_matches('/'));
    }
    out
}

/// Build a collection prefix from key prefix segments.
///
/// The trailing slash keeps `/network/a` from matching `/network/ab`.
pub fn key_prefix<S: AsRef<str>>(segments: &[S]) -> String {
    let mut out = key(segments);
    out.push('/');
    out
}

/// Split a full key back into the segments below the root chain.
pub fn parse_key(full: &str) -> Result<Vec<&str>> {
    let mut parts = full.trim_matches('/').split('/');
    for root in ROOT_CHAIN {
        if parts.next() != Some(root) {
            return Err(StateError::InvalidKey(format!(
                "{} is not under /{}",
                full,
                ROOT_CHAIN.join("/")
            )));
        }
    }
    Ok(parts.filter(|p| !p.is_empty()).collect())
}

/// Every directory prefix (with trailing slash) above a key.
///
/// `/a/b/c` yields `/a/`, `/a/b/`.
pub(crate) fn parent_prefixes(key: &str) -> Vec<String> {
    key.match_indices('/')
        .skip(1)
        .map(|(idx, _)| key[..=idx].to_string())
        .collect()
}

/// Normalize a prefix so directory lookups always carry a trailing slash.
pub(crate) fn dir_prefix(prefix: &str) -> String {
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

/// A stored entry with metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// The key.
    pub key: String,
    /// The value (opaque bytes).
    pub value: Vec<u8>,
    /// Store revision of the last write to this key.
    pub version: u64,
    /// When the entry was created.
    pub created_at: SystemTime,
    /// When the entry was last updated.
    pub updated_at: SystemTime,
}

/// Validate that a key is well-formed.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StateError::InvalidKey("key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(StateError::InvalidKey(format!(
            "key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    if !key.starts_with('/') {
        return Err(StateError::InvalidKey(
            "key must start with '/'".to_string(),
        ));
    }
    if key.ends_with('/') {
        return Err(StateError::InvalidKey(
            "key must not end with '/'".to_string(),
        ));
    }
    Ok(())
}

/// Validate an object id used as a single key segment.
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() || segment.contains('/') {
        return Err(StateError::InvalidKey(format!(
            "{:?} is not a valid key segment",
            segment
        )));
    }
    Ok(())
}

/// The key-value store contract the synchronization engine is built on.
///
/// Backends must be safe for concurrent use from many tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get an entry by key.
    ///
    /// Returns `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Entry>>;

    /// Write `value` at `key` if the key's current version equals
    /// `expected_version`.
    ///
    /// An `expected_version` of 0 means the key must not exist yet.
    /// Returns the new version, or `VersionConflict`.
    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<u64>;

    /// Delete `key` if its current version equals `expected_version`.
    ///
    /// Returns `KeyNotFound` if the key is already gone.
    async fn delete(&self, key: &str, expected_version: u64) -> Result<()>;

    /// List all entries under a prefix, in key order.
    ///
    /// Returns `KeyNotFound` if nothing was ever written under the prefix;
    /// a prefix whose keys were all deleted yields an empty list.
    async fn list(&self, prefix: &str) -> Result<Vec<Entry>>;

    /// Watch for per-key changes matching a pattern.
    ///
    /// Pattern can be an exact key or end with `*` for prefix matching.
    fn watch(&self, pattern: &str) -> Result<WatchStream>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Get the current version of a key (0 if not exists).
    async fn version(&self, key: &str) -> Result<u64> {
        Ok(self.get(key).await?.map(|e| e.version).unwrap_or(0))
    }
}
