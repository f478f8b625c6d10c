//! Folding store snapshots into the live tables.
//!
//! A snapshot is applied in two passes. Every entry is upserted first: new
//! objects are materialized, known ones take the remote version if it is
//! strictly newer. Whatever remains in the prune set afterwards was absent
//! from the snapshot and is re-read from its store; only a confirmed
//! `KeyNotFound` removes it from the live table.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::controller::Controller;
use crate::datastore::KvObject;
use crate::endpoint::{network_id_from_key, Endpoint};
use crate::network::Network;
use crate::store::{key, Entry};

/// Outcome of offering a remote copy to a live object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteUpdate {
    /// The remote version was newer and has been taken.
    Applied,
    /// Same version as the live object.
    Unchanged,
    /// Older than the live object; ignored.
    Stale,
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Objects added to the live table.
    pub created: usize,
    /// Live objects that took a newer remote version.
    pub updated: usize,
    /// Entries whose version matched the live object.
    pub unchanged: usize,
    /// Entries older than the live object.
    pub stale: usize,
    /// Entries that could not be decoded or attached.
    pub skipped: usize,
    /// Objects removed after their absence was confirmed.
    pub deleted: usize,
    /// Prune candidates kept because the re-read found them or failed.
    pub retained: usize,
}

impl ReconcileReport {
    fn record(&mut self, update: RemoteUpdate) {
        match update {
            RemoteUpdate::Applied => self.updated += 1,
            RemoteUpdate::Unchanged => self.unchanged += 1,
            RemoteUpdate::Stale => self.stale += 1,
        }
    }

    /// Whether the pass changed the live table or any live object.
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.deleted > 0
    }
}

impl Controller {
    /// Apply a snapshot of network entries.
    ///
    /// With a prune set, networks in it that the snapshot does not mention
    /// are re-read and dropped if the store no longer has them.
    pub async fn reconcile_networks(
        &self,
        entries: &[Entry],
        prune: Option<HashMap<String, Arc<Network>>>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut prune = prune;

        for entry in entries {
            let remote = match Network::from_entry(entry) {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "skipping undecodable network entry");
                    report.skipped += 1;
                    continue;
                }
            };
            if let Some(prune) = prune.as_mut() {
                prune.remove(remote.id());
            }

            if let Some(live) = self.networks.get(remote.id()) {
                report.record(live.apply_remote(&remote));
                continue;
            }

            let id = remote.id().to_string();
            let (live, inserted) = self.networks.insert_if_absent(&id, Arc::new(remote.materialize()));
            if !inserted {
                // Created locally between the lookup and the insert.
                report.unchanged += 1;
                continue;
            }
            report.created += 1;
            debug!(network = %live.id(), name = %live.name(), version = live.index(), "network added from store");
            if let Err(err) = self.start_endpoint_watch(&live) {
                warn!(network = %live.id(), error = %err, "failed to start endpoint watch");
            }
        }

        for (id, candidate) in prune.unwrap_or_default() {
            // Only the instance that was live when the prune set was taken.
            let Some(live) = self.networks.get(&id) else {
                continue;
            };
            if !Arc::ptr_eq(&live, &candidate) {
                continue;
            }
            let Some(store) = self.data_store(live.scope()) else {
                report.retained += 1;
                continue;
            };

            match store.get_object(&key(&live.key()), &live.scratch_copy()).await {
                Err(err) if err.is_not_found() => {
                    if self.remove_network_locally(&live).await {
                        info!(network = %id, name = %live.name(), "network deleted from store");
                        report.deleted += 1;
                    }
                }
                Ok(()) => {
                    debug!(network = %id, "network still in store, keeping it");
                    report.retained += 1;
                }
                Err(err) => {
                    warn!(network = %id, error = %err, "could not confirm network deletion, keeping it");
                    report.retained += 1;
                }
            }
        }

        report
    }

    /// Apply a snapshot of endpoint entries.
    ///
    /// Entries are attached to their network through the network id in the
    /// key; entries for unknown networks are skipped.
    pub async fn reconcile_endpoints(
        &self,
        entries: &[Entry],
        prune: Option<HashMap<String, Arc<Endpoint>>>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut prune = prune;

        for entry in entries {
            let network = match network_id_from_key(&entry.key)
                .and_then(|network_id| self.network_by_id(&network_id))
            {
                Ok(network) => network,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "skipping endpoint entry without a network");
                    report.skipped += 1;
                    continue;
                }
            };
            let remote = match Endpoint::from_entry(entry, &network) {
                Ok(remote) => remote,
                Err(err) => {
                    warn!(key = %entry.key, error = %err, "skipping undecodable endpoint entry");
                    report.skipped += 1;
                    continue;
                }
            };
            if let Some(prune) = prune.as_mut() {
                prune.remove(remote.id());
            }

            let table = network.endpoint_table();
            if let Ok(live) = network.endpoint_by_id(remote.id()) {
                report.record(live.apply_remote(&remote));
                continue;
            }

            let id = remote.id().to_string();
            let (live, inserted) = table.insert_if_absent(&id, Arc::new(remote.materialize()));
            if inserted {
                debug!(network = %network.id(), endpoint = %live.id(), version = live.index(), "endpoint added from store");
                report.created += 1;
            } else {
                report.unchanged += 1;
            }
        }

        for (id, candidate) in prune.unwrap_or_default() {
            let Ok(network) = self.network_by_id(candidate.network_id()) else {
                continue;
            };
            let table = network.endpoint_table();
            let Some(live) = table.get(&id) else {
                continue;
            };
            if !Arc::ptr_eq(&live, &candidate) {
                continue;
            }
            let Some(store) = self.data_store(live.data_scope()) else {
                report.retained += 1;
                continue;
            };

            match store.get_object(&key(&live.key()), &live.scratch_copy()).await {
                Err(err) if err.is_not_found() => {
                    if table.remove_if_same(&id, &live) {
                        info!(network = %network.id(), endpoint = %id, "endpoint deleted from store");
                        report.deleted += 1;
                    }
                }
                Ok(()) => {
                    debug!(endpoint = %id, "endpoint still in store, keeping it");
                    report.retained += 1;
                }
                Err(err) => {
                    warn!(endpoint = %id, error = %err, "could not confirm endpoint deletion, keeping it");
                    report.retained += 1;
                }
            }
        }

        report
    }
}
