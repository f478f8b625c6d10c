//! The controller: live network table, store handles and bootstrap.
//!
//! Local API calls mutate live objects and persist them through the store
//! handle of their scope. Bootstrap loads persisted state once per scope;
//! the watch loops keep the table in sync with the
//! global store afterwards.

use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::datastore::{DataScope, DataStore, KvObject};
use crate::endpoint::Endpoint;
use crate::error::{Result, StateError};
use crate::network::{Network, NetworkOptions};
use crate::store::{key_prefix, Entry, KvStore, ENDPOINT_KEY_PREFIX, NETWORK_KEY_PREFIX};
use crate::supervisor::{WatchFailure, WatchSupervisor};
use crate::table::Table;

/// Builds a [`Controller`], opening stores from configuration unless
/// backends are supplied directly.
pub struct ControllerBuilder {
    config: Config,
    local_store: Option<Arc<dyn KvStore>>,
    global_store: Option<Arc<dyn KvStore>>,
}

impl ControllerBuilder {
    /// Use `store` as the local store instead of the configured one.
    pub fn local_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.local_store = Some(store);
        self
    }

    /// Use `store` as the global store instead of the configured one.
    pub fn global_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.global_store = Some(store);
        self
    }

    /// Open the stores and bootstrap the global, then the local scope.
    pub async fn build(self) -> Result<Arc<Controller>> {
        self.config.validate()?;
        let watch = &self.config.watch;

        let local = match self.local_store {
            Some(store) => store,
            None => self.config.local_store_config().open(watch).await?,
        };
        let global = match self.global_store {
            Some(store) => Some(store),
            None => match self.config.global_store_config() {
                Some(cfg) => Some(cfg.open(watch).await?),
                None => {
                    debug!("no global store configured, running local-only");
                    None
                }
            },
        };

        let snapshot_capacity = watch.snapshot_capacity;
        let controller = Arc::new_cyclic(|weak| Controller {
            networks: Table::new(),
            local_store: DataStore::new(DataScope::Local, local)
                .with_snapshot_capacity(snapshot_capacity),
            global_store: global.map(|store| {
                DataStore::new(DataScope::Global, store).with_snapshot_capacity(snapshot_capacity)
            }),
            supervisor: WatchSupervisor::new(),
            weak_self: weak.clone(),
            config: self.config,
        });

        for scope in [DataScope::Global, DataScope::Local] {
            if let Err(err) = controller.bootstrap(scope).await {
                controller.shutdown().await;
                return Err(err);
            }
        }

        info!(
            networks = controller.networks.len(),
            global = controller.global_store.is_some(),
            "controller started"
        );
        Ok(controller)
    }
}

/// Owner of the live network table and the store handles.
pub struct Controller {
    config: Config,
    pub(crate) networks: Table<Network>,
    local_store: DataStore,
    global_store: Option<DataStore>,
    pub(crate) supervisor: WatchSupervisor,
    pub(crate) weak_self: Weak<Controller>,
}

impl Controller {
    /// Start configuring a controller.
    pub fn builder(config: Config) -> ControllerBuilder {
        ControllerBuilder {
            config,
            local_store: None,
            global_store: None,
        }
    }

    /// Open the configured stores and bootstrap.
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        Self::builder(config).build().await
    }

    /// The configuration the controller was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The store handle for a scope, if one exists.
    pub fn data_store(&self, scope: DataScope) -> Option<&DataStore> {
        match scope {
            DataScope::Local => Some(&self.local_store),
            DataScope::Global => self.global_store.as_ref(),
        }
    }

    /// The local store handle.
    pub fn local_store(&self) -> &DataStore {
        &self.local_store
    }

    /// The global store handle, if configured.
    pub fn global_store(&self) -> Option<&DataStore> {
        self.global_store.as_ref()
    }

    /// Load persisted networks (and, for the local scope, endpoints) of
    /// `scope` into the live table.
    ///
    /// Only store-communication errors fail; an absent collection is empty.
    /// Bootstrapping the global scope also starts the network watch.
    /// Running it again against an unchanged store changes nothing.
    pub async fn bootstrap(&self, scope: DataScope) -> Result<()> {
        let Some(store) = self.data_store(scope) else {
            debug!(%scope, "no store for scope, skipping bootstrap");
            return Ok(());
        };

        let networks = list_or_empty(store, &key_prefix(&[NETWORK_KEY_PREFIX])).await?;
        let report = self.reconcile_networks(&networks, None).await;
        debug!(%scope, ?report, "bootstrapped networks");

        match scope {
            DataScope::Local => {
                let endpoints = list_or_empty(store, &key_prefix(&[ENDPOINT_KEY_PREFIX])).await?;
                let report = self.reconcile_endpoints(&endpoints, None).await;
                debug!(%scope, ?report, "bootstrapped endpoints");
            }
            DataScope::Global => self.watch_networks()?,
        }
        Ok(())
    }

    /// Persist a newly created object to the store of its scope.
    pub async fn persist_create(&self, obj: &dyn KvObject) -> Result<()> {
        self.persist_update(obj).await
    }

    /// Persist an object to the store of its scope.
    ///
    /// Without a store for the scope this is a logged no-op.
    pub async fn persist_update(&self, obj: &dyn KvObject) -> Result<()> {
        let Some(store) = self.data_store(obj.data_scope()) else {
            debug!(key = ?obj.key(), scope = %obj.data_scope(), "no store for scope, object not persisted");
            return Ok(());
        };
        store.put_object_atomic(obj).await
    }

    /// Delete an object from the store of its scope.
    ///
    /// Objects that were never persisted, or have no store, are skipped.
    pub async fn persist_delete(&self, obj: &dyn KvObject) -> Result<()> {
        let Some(store) = self.data_store(obj.data_scope()) else {
            debug!(key = ?obj.key(), scope = %obj.data_scope(), "no store for scope, object not deleted");
            return Ok(());
        };
        if !obj.exists() {
            return Ok(());
        }
        store.delete_object_atomic(obj).await
    }

    /// Create, persist and start tracking a network.
    pub async fn new_network(
        &self,
        name: &str,
        network_type: &str,
        options: NetworkOptions,
    ) -> Result<Arc<Network>> {
        if self.networks.find(|n| n.name() == name).is_some() {
            return Err(StateError::NetworkNameExists(name.to_string()));
        }

        let network = Network::new(name, network_type, options);
        self.persist_create(&network).await?;

        // The network watch may have materialized it already.
        let (network, _) = self
            .networks
            .insert_if_absent(&network.id().to_string(), Arc::new(network));
        info!(network = %network.id(), name = %network.name(), scope = %network.scope(), "network created");

        self.start_endpoint_watch(&network)?;
        Ok(network)
    }

    /// Delete a network without endpoints from its store and the table.
    pub async fn delete_network(&self, id: &str) -> Result<()> {
        let network = self.network_by_id(id)?;
        // The persisted count only moves forward with the network's version,
        // unlike the endpoint table which a stale snapshot may refill.
        let count = network.endpoint_count();
        if count > 0 {
            return Err(StateError::ActiveEndpoints {
                name: network.name().to_string(),
                count: count as usize,
            });
        }

        match self.persist_delete(network.as_ref()).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(network = %id, "network already gone from store");
            }
            Err(err) => return Err(err),
        }

        self.remove_network_locally(&network).await;
        Ok(())
    }

    /// Detach a network from the table and stop its endpoint watch.
    pub(crate) async fn remove_network_locally(&self, network: &Arc<Network>) -> bool {
        if !self.networks.remove_if_same(network.id(), network) {
            return false;
        }
        self.stop_endpoint_watch(network).await;
        info!(network = %network.id(), name = %network.name(), "network removed");
        true
    }

    /// Look up a network by id.
    pub fn network_by_id(&self, id: &str) -> Result<Arc<Network>> {
        self.networks
            .get(id)
            .ok_or_else(|| StateError::NoSuchNetwork(id.to_string()))
    }

    /// Look up a network by name.
    pub fn network_by_name(&self, name: &str) -> Result<Arc<Network>> {
        self.networks
            .find(|n| n.name() == name)
            .ok_or_else(|| StateError::NoSuchNetwork(name.to_string()))
    }

    /// Every tracked network.
    pub fn networks(&self) -> Vec<Arc<Network>> {
        self.networks.values()
    }

    /// Create and persist an endpoint on a network, bumping the network's
    /// endpoint count.
    pub async fn new_endpoint(&self, network_id: &str, name: &str) -> Result<Arc<Endpoint>> {
        let network = self.network_by_id(network_id)?;
        if network.endpoint_by_name(name).is_ok() {
            return Err(StateError::EndpointNameExists(name.to_string()));
        }

        let endpoint = Endpoint::new(name, &network);
        self.persist_create(&endpoint).await?;
        let (endpoint, _) = network
            .endpoint_table()
            .insert_if_absent(&endpoint.id().to_string(), Arc::new(endpoint));

        network.increment_endpoint_count();
        if let Err(err) = self.persist_update(network.as_ref()).await {
            warn!(network = %network.id(), error = %err, "failed to record endpoint count, rolling back endpoint");
            network.decrement_endpoint_count();
            network.endpoint_table().remove_if_same(endpoint.id(), &endpoint);
            if let Err(rollback) = self.persist_delete(endpoint.as_ref()).await {
                warn!(endpoint = %endpoint.id(), error = %rollback, "failed to roll back endpoint");
            }
            return Err(err);
        }

        info!(network = %network.id(), endpoint = %endpoint.id(), name = %endpoint.name(), "endpoint created");
        Ok(endpoint)
    }

    /// Delete an endpoint from its store and its network.
    pub async fn delete_endpoint(&self, network_id: &str, endpoint_id: &str) -> Result<()> {
        let network = self.network_by_id(network_id)?;
        let endpoint = network.endpoint_by_id(endpoint_id)?;

        // Whoever removed the stored endpoint owns the count update, even if
        // a watch detached the live copy first.
        let removed_here = match self.persist_delete(endpoint.as_ref()).await {
            Ok(()) => true,
            Err(err) if err.is_not_found() => {
                debug!(endpoint = %endpoint_id, "endpoint already gone from store");
                false
            }
            Err(err) => return Err(err),
        };

        network.endpoint_table().remove_if_same(endpoint_id, &endpoint);
        if removed_here {
            network.decrement_endpoint_count();
            if let Err(err) = self.persist_update(network.as_ref()).await {
                warn!(network = %network.id(), error = %err, "failed to record endpoint count");
            }
        }
        info!(network = %network_id, endpoint = %endpoint_id, "endpoint deleted");
        Ok(())
    }

    /// Bind an endpoint to a sandbox and persist the binding.
    pub async fn join_endpoint(&self, endpoint: &Endpoint, sandbox_id: &str) -> Result<()> {
        self.set_sandbox(endpoint, Some(sandbox_id.to_string())).await
    }

    /// Clear an endpoint's sandbox binding and persist it.
    pub async fn leave_endpoint(&self, endpoint: &Endpoint) -> Result<()> {
        self.set_sandbox(endpoint, None).await
    }

    async fn set_sandbox(&self, endpoint: &Endpoint, sandbox_id: Option<String>) -> Result<()> {
        let previous = endpoint.sandbox_id();
        endpoint.set_sandbox_id(sandbox_id);
        if let Err(err) = self.persist_update(endpoint).await {
            endpoint.set_sandbox_id(previous);
            return Err(err);
        }
        Ok(())
    }

    /// Names of the running watches.
    pub fn active_watches(&self) -> Vec<String> {
        self.supervisor.active()
    }

    /// Watches that ended without being cancelled.
    pub fn watch_failures(&self) -> Vec<WatchFailure> {
        self.supervisor.failures()
    }

    /// Cancel and join every watch, the network watch included.
    pub async fn shutdown(&self) {
        for network in self.networks.values() {
            network.disarm_watch();
        }
        self.supervisor.shutdown().await;
        info!("controller stopped");
    }
}

/// List a collection, treating a never-created one as empty.
async fn list_or_empty(store: &DataStore, prefix: &str) -> Result<Vec<Entry>> {
    match store.list(prefix).await {
        Ok(entries) => Ok(entries),
        Err(err) if err.is_not_found() => Ok(Vec::new()),
        Err(err) => Err(err),
    }
}
