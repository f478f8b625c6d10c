//! In-memory key-value store.
//!
//! Data lives in a process-local BTreeMap and is lost on exit. A single
//! `MemoryStore` shared behind an `Arc` can stand in for a cluster-wide
//! global store: every controller holding it sees the others' writes
//! through watches.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;

use crate::error::{Result, StateError};
use crate::store::{dir_prefix, parent_prefixes, validate_key, Entry, KvStore};
use crate::watch::{WatchEvent, WatchSender, WatchStream, DEFAULT_EVENT_CAPACITY};

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    /// Every directory prefix that ever held a key. Never shrinks, so an
    /// emptied collection keeps listing as empty instead of absent; one
    /// entry per deleted network's endpoint directory is the cost.
    dirs: BTreeSet<String>,
    /// Last revision handed out.
    revision: u64,
}

/// In-memory implementation of KvStore.
///
/// Uses a BTreeMap for ordered key iteration and RwLock for concurrency.
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    watcher: WatchSender,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Create a store whose watch channel buffers `capacity` events.
    pub fn with_event_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            watcher: WatchSender::new(capacity),
        }
    }

    /// Get the number of entries in the store.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// The last revision assigned to a write.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Entry>> {
        validate_key(key)?;
        Ok(self.inner.read().entries.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>, expected_version: u64) -> Result<u64> {
        validate_key(key)?;

        let (version, event) = {
            let mut inner = self.inner.write();
            let current = inner.entries.get(key);
            let current_version = current.map(|e| e.version).unwrap_or(0);

            if current_version != expected_version {
                return Err(StateError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    found: current_version,
                });
            }

            let now = SystemTime::now();
            let created_at = current.map(|e| e.created_at).unwrap_or(now);
            let event = match current {
                Some(_) => WatchEvent::updated(key),
                None => WatchEvent::created(key),
            };

            inner.revision += 1;
            let version = inner.revision;
            inner.entries.insert(
                key.to_string(),
                Entry {
                    key: key.to_string(),
                    value,
                    version,
                    created_at,
                    updated_at: now,
                },
            );
            inner.dirs.extend(parent_prefixes(key));
            (version, event)
        };

        self.watcher.send(event);
        Ok(version)
    }

    async fn delete(&self, key: &str, expected_version: u64) -> Result<()> {
        validate_key(key)?;

        {
            let mut inner = self.inner.write();
            let current_version = match inner.entries.get(key) {
                Some(entry) => entry.version,
                None => return Err(StateError::KeyNotFound(key.to_string())),
            };
            if current_version != expected_version {
                return Err(StateError::VersionConflict {
                    key: key.to_string(),
                    expected: expected_version,
                    found: current_version,
                });
            }
            inner.revision += 1;
            inner.entries.remove(key);
        }

        self.watcher.send(WatchEvent::deleted(key));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        let prefix = dir_prefix(prefix);
        let inner = self.inner.read();
        if !inner.dirs.contains(&prefix) {
            return Err(StateError::KeyNotFound(prefix));
        }
        Ok(inner
            .entries
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.clone())
            .collect())
    }

    fn watch(&self, pattern: &str) -> Result<WatchStream> {
        Ok(self.watcher.subscribe(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryStore::new();

        let version = store.put("/test/key", b"value".to_vec(), 0).await.unwrap();
        assert_eq!(version, 1);

        let entry = store.get("/test/key").await.unwrap().unwrap();
        assert_eq!(entry.key, "/test/key");
        assert_eq!(entry.value, b"value");
        assert_eq!(entry.version, 1);
    }

    #[tokio::test]
    async fn test_versions_increase_across_keys() {
        let store = MemoryStore::new();

        let v1 = store.put("/a", b"1".to_vec(), 0).await.unwrap();
        let v2 = store.put("/b", b"2".to_vec(), 0).await.unwrap();
        let v3 = store.put("/a", b"3".to_vec(), v1).await.unwrap();

        assert!(v1 < v2 && v2 < v3);
        assert_eq!(store.revision(), v3);
    }

    #[tokio::test]
    async fn test_recreated_key_gets_newer_version() {
        let store = MemoryStore::new();

        let v1 = store.put("/key", b"a".to_vec(), 0).await.unwrap();
        store.delete("/key", v1).await.unwrap();
        let v2 = store.put("/key", b"b".to_vec(), 0).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_put_conflict() {
        let store = MemoryStore::new();

        let v1 = store.put("/key", b"v1".to_vec(), 0).await.unwrap();
        store.put("/key", b"v2".to_vec(), v1).await.unwrap();

        let result = store.put("/key", b"v3".to_vec(), v1).await;
        assert!(matches!(result, Err(StateError::VersionConflict { expected: 1, found: 2, .. })));

        // Creating over an existing key conflicts too.
        let result = store.put("/key", b"v3".to_vec(), 0).await;
        assert!(matches!(result, Err(StateError::VersionConflict { .. })));

        let entry = store.get("/key").await.unwrap().unwrap();
        assert_eq!(entry.value, b"v2");
    }

    #[tokio::test]
    async fn test_delete() {
        let store = MemoryStore::new();

        let version = store.put("/key", b"value".to_vec(), 0).await.unwrap();
        assert!(store.exists("/key").await.unwrap());

        let result = store.delete("/key", version + 1).await;
        assert!(matches!(result, Err(StateError::VersionConflict { .. })));

        store.delete("/key", version).await.unwrap();
        assert!(!store.exists("/key").await.unwrap());

        let result = store.delete("/key", version).await;
        assert!(matches!(result, Err(StateError::KeyNotFound(_))));
    }

    #[tokio::test]
    async fn test_list() {
        let store = MemoryStore::new();

        store.put("/networks/a", b"1".to_vec(), 0).await.unwrap();
        store.put("/networks/b", b"2".to_vec(), 0).await.unwrap();
        store.put("/networksx/c", b"3".to_vec(), 0).await.unwrap();

        let networks = store.list("/networks").await.unwrap();
        let keys: Vec<_> = networks.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/networks/a", "/networks/b"]);
    }

    #[tokio::test]
    async fn test_list_absent_versus_empty() {
        let store = MemoryStore::new();

        let result = store.list("/networks/").await;
        assert!(matches!(result, Err(StateError::KeyNotFound(_))));

        let version = store.put("/networks/a", b"1".to_vec(), 0).await.unwrap();
        store.delete("/networks/a", version).await.unwrap();
        assert!(store.list("/networks/").await.unwrap().is_empty());

        // Nested directories outlive their last key too.
        let version = store.put("/networks/n1/e1", b"1".to_vec(), 0).await.unwrap();
        store.delete("/networks/n1/e1", version).await.unwrap();
        assert!(store.list("/networks/n1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_key() {
        let store = MemoryStore::new();

        let result = store.put("no-leading-slash", b"v".to_vec(), 0).await;
        assert!(matches!(result, Err(StateError::InvalidKey(_))));
    }
}
