//! Concurrent id-keyed tables of live objects.
//!
//! A table lock guards membership only. Callers clone the `Arc` out and
//! release the table before touching the object's own lock, so the table
//! lock and an object lock are never held at the same time.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A shared map from object id to live object.
pub struct Table<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Table<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Look up an object by id.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.entries.read().get(id).cloned()
    }

    /// Whether an object with `id` is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    /// Insert `value` unless `id` is taken.
    ///
    /// Returns the object now in the table and whether it is the one passed in.
    pub fn insert_if_absent(&self, id: &str, value: Arc<T>) -> (Arc<T>, bool) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(id) {
            return (existing.clone(), false);
        }
        entries.insert(id.to_string(), value.clone());
        (value, true)
    }

    /// Remove an object, returning it if it was present.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.entries.write().remove(id)
    }

    /// Remove `id` only if it still maps to `expected`.
    pub fn remove_if_same(&self, id: &str, expected: &Arc<T>) -> bool {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(current) if Arc::ptr_eq(current, expected) => {
                entries.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Copy of the entries accepted by `filter`.
    pub fn snapshot_filtered(&self, filter: impl Fn(&T) -> bool) -> HashMap<String, Arc<T>> {
        self.entries
            .read()
            .iter()
            .filter(|(_, v)| filter(v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Every object currently in the table.
    pub fn values(&self) -> Vec<Arc<T>> {
        self.entries.read().values().cloned().collect()
    }

    /// Find the first object accepted by `pred`.
    pub fn find(&self, pred: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.entries.read().values().find(|v| pred(v)).cloned()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self::new()
    }
}
