//! Live network objects.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::datastore::{DataScope, KvObject};
use crate::endpoint::Endpoint;
use crate::error::{Result, StateError};
use crate::reconcile::RemoteUpdate;
use crate::store::{validate_segment, Entry, NETWORK_KEY_PREFIX};
use crate::table::Table;

/// Persisted attributes of a network.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NetworkRecord {
    id: String,
    name: String,
    network_type: String,
    scope: DataScope,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    endpoint_count: u64,
    #[serde(default = "default_persist")]
    persist: bool,
}

fn default_persist() -> bool {
    true
}

/// Creation options for a network.
#[derive(Debug, Clone)]
pub struct NetworkOptions {
    /// Store the network is persisted to.
    pub scope: DataScope,
    /// Free-form labels, persisted with the network.
    pub labels: BTreeMap<String, String>,
    /// Whether the network is written to a store at all.
    pub persist: bool,
}

impl Default for NetworkOptions {
    fn default() -> Self {
        Self {
            scope: DataScope::Local,
            labels: BTreeMap::new(),
            persist: true,
        }
    }
}

impl NetworkOptions {
    /// Options for a network in the given scope.
    pub fn scoped(scope: DataScope) -> Self {
        Self {
            scope,
            ..Self::default()
        }
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Keep the network in memory only.
    pub fn ephemeral(mut self) -> Self {
        self.persist = false;
        self
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    db_index: u64,
    db_exists: bool,
    endpoint_count: u64,
    stop_watch: Option<CancellationToken>,
}

/// A network tracked by the controller.
///
/// Identity and creation-time attributes are immutable. Store bookkeeping,
/// the endpoint count and the endpoint-watch token sit behind the network's
/// own lock; the endpoint table has its own.
pub struct Network {
    id: String,
    name: String,
    network_type: String,
    scope: DataScope,
    labels: BTreeMap<String, String>,
    persist: bool,
    transient: bool,
    state: Mutex<NetworkState>,
    endpoints: Table<Endpoint>,
}

impl fmt::Debug for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Network")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}

impl Network {
    /// Build a new, never persisted network with a fresh id.
    pub fn new(
        name: impl Into<String>,
        network_type: impl Into<String>,
        options: NetworkOptions,
    ) -> Self {
        Self::from_record(
            NetworkRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.into(),
                network_type: network_type.into(),
                scope: options.scope,
                labels: options.labels,
                endpoint_count: 0,
                persist: options.persist,
            },
            false,
        )
    }

    fn from_record(record: NetworkRecord, transient: bool) -> Self {
        Self {
            id: record.id,
            name: record.name,
            network_type: record.network_type,
            scope: record.scope,
            labels: record.labels,
            persist: record.persist,
            transient,
            state: Mutex::new(NetworkState {
                endpoint_count: record.endpoint_count,
                ..NetworkState::default()
            }),
            endpoints: Table::new(),
        }
    }

    fn record(&self) -> NetworkRecord {
        NetworkRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            network_type: self.network_type.clone(),
            scope: self.scope,
            labels: self.labels.clone(),
            endpoint_count: self.endpoint_count(),
            persist: self.persist,
        }
    }

    /// Decode a store entry into a transient scratch copy carrying the
    /// entry's version.
    pub(crate) fn from_entry(entry: &Entry) -> Result<Self> {
        let record: NetworkRecord = serde_json::from_slice(&entry.value)?;
        validate_segment(&record.id)?;
        let scratch = Self::from_record(record, true);
        scratch.set_index(entry.version);
        Ok(scratch)
    }

    /// Turn a scratch copy into a live network with the same store state.
    pub(crate) fn materialize(self) -> Self {
        let (index, exists) = {
            let state = self.state.lock();
            (state.db_index, state.db_exists)
        };
        let live = Self::from_record(self.record(), false);
        {
            let mut state = live.state.lock();
            state.db_index = index;
            state.db_exists = exists;
        }
        live
    }

    /// A transient copy used to re-read this network from its store.
    pub(crate) fn scratch_copy(&self) -> Self {
        Self::from_record(self.record(), true)
    }

    /// Take version-tracking fields from a remote copy if it is newer.
    pub(crate) fn apply_remote(&self, remote: &Network) -> RemoteUpdate {
        let remote_index = remote.index();
        let remote_count = remote.endpoint_count();
        let mut state = self.state.lock();
        if remote_index < state.db_index {
            return RemoteUpdate::Stale;
        }
        if remote_index == state.db_index {
            return RemoteUpdate::Unchanged;
        }
        state.db_index = remote_index;
        state.db_exists = true;
        state.endpoint_count = remote_count;
        RemoteUpdate::Applied
    }

    /// Unique id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Driver type the network was created with.
    pub fn network_type(&self) -> &str {
        &self.network_type
    }

    /// Store scope.
    pub fn scope(&self) -> DataScope {
        self.scope
    }

    /// Labels given at creation.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Whether the network lives in the global store.
    pub fn is_global_scoped(&self) -> bool {
        self.scope == DataScope::Global
    }

    /// Whether the network is written to a store.
    pub fn is_persistent(&self) -> bool {
        self.persist
    }

    /// Number of endpoints, as last written or replicated.
    pub fn endpoint_count(&self) -> u64 {
        self.state.lock().endpoint_count
    }

    pub(crate) fn increment_endpoint_count(&self) {
        self.state.lock().endpoint_count += 1;
    }

    pub(crate) fn decrement_endpoint_count(&self) {
        let mut state = self.state.lock();
        state.endpoint_count = state.endpoint_count.saturating_sub(1);
    }

    /// Look up an endpoint by id.
    pub fn endpoint_by_id(&self, id: &str) -> Result<Arc<Endpoint>> {
        self.endpoints
            .get(id)
            .ok_or_else(|| StateError::NoSuchEndpoint(id.to_string()))
    }

    /// Look up an endpoint by name.
    pub fn endpoint_by_name(&self, name: &str) -> Result<Arc<Endpoint>> {
        self.endpoints
            .find(|ep| ep.name() == name)
            .ok_or_else(|| StateError::NoSuchEndpoint(name.to_string()))
    }

    /// Every endpoint currently attached.
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub(crate) fn endpoint_table(&self) -> &Table<Endpoint> {
        &self.endpoints
    }

    /// Whether an endpoint watch is armed for this network.
    pub fn is_watching(&self) -> bool {
        self.state.lock().stop_watch.is_some()
    }

    /// Install a fresh watch token. Returns `None` if one is already armed.
    pub(crate) fn arm_watch(&self) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        if state.stop_watch.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        state.stop_watch = Some(token.clone());
        Some(token)
    }

    /// Cancel and clear the watch token, if any.
    pub(crate) fn disarm_watch(&self) -> bool {
        let token = self.state.lock().stop_watch.take();
        match token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

impl KvObject for Network {
    fn key(&self) -> Vec<String> {
        vec![NETWORK_KEY_PREFIX.to_string(), self.id.clone()]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec![NETWORK_KEY_PREFIX.to_string()]
    }

    fn value(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.record())?)
    }

    fn set_value(&self, value: &[u8]) -> Result<()> {
        let record: NetworkRecord = serde_json::from_slice(value)?;
        if record.id != self.id {
            return Err(StateError::SerializationError(format!(
                "network value for {} decoded into {}",
                record.id, self.id
            )));
        }
        self.state.lock().endpoint_count = record.endpoint_count;
        Ok(())
    }

    fn index(&self) -> u64 {
        self.state.lock().db_index
    }

    fn set_index(&self, index: u64) {
        let mut state = self.state.lock();
        state.db_index = index;
        state.db_exists = true;
    }

    fn exists(&self) -> bool {
        self.state.lock().db_exists
    }

    fn skip(&self) -> bool {
        self.transient || !self.persist
    }

    fn data_scope(&self) -> DataScope {
        self.scope
    }
}
