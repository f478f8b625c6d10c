//! Store handles and the versioned object contract.
//!
//! A [`DataStore`] wraps one [`KvStore`] and tags it with the [`DataScope`]
//! it serves. Objects implementing [`KvObject`] are written and deleted
//! through it with compare-and-swap semantics on their last known version.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{Result, StateError};
use crate::store::{key, key_prefix, Entry, KvStore};
use crate::watch::{self, TreeWatch, DEFAULT_SNAPSHOT_CAPACITY};

/// Which store an object is persisted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataScope {
    /// Single-node store, durable across restarts.
    Local,
    /// Cluster-wide store shared by every controller.
    Global,
}

impl fmt::Display for DataScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataScope::Local => f.write_str("local"),
            DataScope::Global => f.write_str("global"),
        }
    }
}

/// An object that can be persisted in a [`DataStore`].
///
/// Implementations keep their mutable state behind their own lock, so every
/// method takes `&self` and may be called on objects shared across tasks.
pub trait KvObject: Send + Sync {
    /// Key segments uniquely addressing this object.
    fn key(&self) -> Vec<String>;

    /// Key segments of the collection this object belongs to.
    fn key_prefix(&self) -> Vec<String>;

    /// Serialized form of the persistable attributes.
    fn value(&self) -> Result<Vec<u8>>;

    /// Take the mutable persisted attributes from a serialized value.
    fn set_value(&self, value: &[u8]) -> Result<()>;

    /// Store version of the last write seen by this copy, 0 if never persisted.
    fn index(&self) -> u64;

    /// Record a store version. Also marks the object as existing.
    fn set_index(&self, index: u64);

    /// Whether the copy is known to have a persisted counterpart.
    fn exists(&self) -> bool;

    /// Whether this object must never be written to a store.
    fn skip(&self) -> bool;

    /// The scope of the store this object lives in.
    fn data_scope(&self) -> DataScope;
}

/// A scope-tagged handle to one backing store.
#[derive(Clone)]
pub struct DataStore {
    scope: DataScope,
    store: Arc<dyn KvStore>,
    snapshot_capacity: usize,
}

impl fmt::Debug for DataStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataStore")
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl DataStore {
    /// Wrap a backend for the given scope.
    pub fn new(scope: DataScope, store: Arc<dyn KvStore>) -> Self {
        Self {
            scope,
            store,
            snapshot_capacity: DEFAULT_SNAPSHOT_CAPACITY,
        }
    }

    /// Set how many snapshots each tree watch buffers.
    pub fn with_snapshot_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_capacity = capacity.max(1);
        self
    }

    /// The scope this handle serves.
    pub fn scope(&self) -> DataScope {
        self.scope
    }

    /// The raw backend, for listing and watching.
    pub fn kv_store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Write `obj` if nobody advanced its key since this copy last saw it.
    ///
    /// On success the object's index is updated in place and it is marked
    /// as existing. Objects that skip persistence are left untouched.
    pub async fn put_object_atomic(&self, obj: &dyn KvObject) -> Result<()> {
        if obj.skip() {
            return Ok(());
        }
        let key = key(&obj.key());
        let value = obj.value()?;
        let expected = if obj.exists() { obj.index() } else { 0 };

        let version = self.store.put(&key, value, expected).await?;
        trace!(scope = %self.scope, key = %key, version, "object written");
        obj.set_index(version);
        Ok(())
    }

    /// Delete `obj` if nobody advanced its key since this copy last saw it.
    pub async fn delete_object_atomic(&self, obj: &dyn KvObject) -> Result<()> {
        if obj.skip() {
            return Ok(());
        }
        let key = key(&obj.key());
        self.store.delete(&key, obj.index()).await?;
        trace!(scope = %self.scope, key = %key, "object deleted");
        Ok(())
    }

    /// Read `key` into `obj`, or fail with `KeyNotFound`.
    pub async fn get_object(&self, key: &str, obj: &dyn KvObject) -> Result<()> {
        let entry = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| StateError::KeyNotFound(key.to_string()))?;
        obj.set_value(&entry.value)?;
        obj.set_index(entry.version);
        Ok(())
    }

    /// Every entry under a collection, or `KeyNotFound` if it never existed.
    pub async fn list(&self, prefix: &str) -> Result<Vec<Entry>> {
        self.store.list(prefix).await
    }

    /// Snapshots of the collection addressed by `segments` until `cancel` fires.
    pub fn watch_tree<S: AsRef<str>>(
        &self,
        segments: &[S],
        cancel: CancellationToken,
    ) -> Result<TreeWatch> {
        watch::watch_tree(
            self.store.clone(),
            &key_prefix(segments),
            cancel,
            self.snapshot_capacity,
        )
    }
}
