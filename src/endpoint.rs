//! Live endpoint objects.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::datastore::{DataScope, KvObject};
use crate::error::{Result, StateError};
use crate::network::Network;
use crate::reconcile::RemoteUpdate;
use crate::store::{parse_key, validate_segment, Entry, ENDPOINT_KEY_PREFIX};

/// Persisted attributes of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EndpointRecord {
    id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sandbox_id: Option<String>,
}

#[derive(Debug, Default)]
struct EndpointState {
    db_index: u64,
    db_exists: bool,
    sandbox_id: Option<String>,
}

/// An endpoint attached to a network.
///
/// The owning network is referenced by id and resolved through the
/// controller's network table.
pub struct Endpoint {
    id: String,
    name: String,
    network_id: String,
    scope: DataScope,
    persist: bool,
    transient: bool,
    state: Mutex<EndpointState>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("network_id", &self.network_id)
            .field("index", &self.index())
            .finish_non_exhaustive()
    }
}

/// Extract the owning network id from an endpoint key.
pub fn network_id_from_key(key: &str) -> Result<String> {
    match parse_key(key)?.as_slice() {
        [prefix, network_id, _endpoint_id] if *prefix == ENDPOINT_KEY_PREFIX => {
            Ok(network_id.to_string())
        }
        _ => Err(StateError::InvalidKey(format!(
            "{} is not an endpoint key",
            key
        ))),
    }
}

impl Endpoint {
    /// Build a new, never persisted endpoint on `network`.
    pub fn new(name: impl Into<String>, network: &Network) -> Self {
        Self::from_record(
            EndpointRecord {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.into(),
                sandbox_id: None,
            },
            network,
            false,
        )
    }

    fn from_record(record: EndpointRecord, network: &Network, transient: bool) -> Self {
        Self {
            id: record.id,
            name: record.name,
            network_id: network.id().to_string(),
            scope: network.scope(),
            persist: network.is_persistent(),
            transient,
            state: Mutex::new(EndpointState {
                sandbox_id: record.sandbox_id,
                ..EndpointState::default()
            }),
        }
    }

    fn record(&self) -> EndpointRecord {
        EndpointRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            sandbox_id: self.sandbox_id(),
        }
    }

    /// Decode a store entry into a transient scratch copy attached to
    /// `network`, carrying the entry's version.
    pub(crate) fn from_entry(entry: &Entry, network: &Network) -> Result<Self> {
        let record: EndpointRecord = serde_json::from_slice(&entry.value)?;
        validate_segment(&record.id)?;
        let scratch = Self::from_record(record, network, true);
        scratch.set_index(entry.version);
        Ok(scratch)
    }

    /// Turn a scratch copy into a live endpoint with the same store state.
    pub(crate) fn materialize(mut self) -> Self {
        self.transient = false;
        self
    }

    /// A transient copy used to re-read this endpoint from its store.
    pub(crate) fn scratch_copy(&self) -> Self {
        Self {
            id: self.id.clone(),
            name: self.name.clone(),
            network_id: self.network_id.clone(),
            scope: self.scope,
            persist: self.persist,
            transient: true,
            state: Mutex::new(EndpointState::default()),
        }
    }

    /// Take version-tracking fields and the sandbox binding from a remote
    /// copy if it is newer.
    pub(crate) fn apply_remote(&self, remote: &Endpoint) -> RemoteUpdate {
        let remote_index = remote.index();
        let remote_sandbox = remote.sandbox_id();
        let mut state = self.state.lock();
        if remote_index < state.db_index {
            return RemoteUpdate::Stale;
        }
        if remote_index == state.db_index {
            return RemoteUpdate::Unchanged;
        }
        state.db_index = remote_index;
        state.db_exists = true;
        state.sandbox_id = remote_sandbox;
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

    /// Id of the owning network.
    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// Sandbox the endpoint is bound to, if joined.
    pub fn sandbox_id(&self) -> Option<String> {
        self.state.lock().sandbox_id.clone()
    }

    pub(crate) fn set_sandbox_id(&self, sandbox_id: Option<String>) {
        self.state.lock().sandbox_id = sandbox_id;
    }
}

impl KvObject for Endpoint {
    fn key(&self) -> Vec<String> {
        vec![
            ENDPOINT_KEY_PREFIX.to_string(),
            self.network_id.clone(),
            self.id.clone(),
        ]
    }

    fn key_prefix(&self) -> Vec<String> {
        vec![ENDPOINT_KEY_PREFIX.to_string(), self.network_id.clone()]
    }

    fn value(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.record())?)
    }

    fn set_value(&self, value: &[u8]) -> Result<()> {
        let record: EndpointRecord = serde_json::from_slice(value)?;
        if record.id != self.id {
            return Err(StateError::SerializationError(format!(
                "endpoint value for {} decoded into {}",
                record.id, self.id
            )));
        }
        self.set_sandbox_id(record.sandbox_id);
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
