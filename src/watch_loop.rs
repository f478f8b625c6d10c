//! Watch loops replicating the global store into the live tables.
//!
//! One loop follows the network collection; one loop per global network
//! follows that network's endpoints. Loops hold only a weak reference to
//! the controller and end when their token is cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::controller::Controller;
use crate::datastore::{DataScope, KvObject};
use crate::error::{Result, StateError};
use crate::network::Network;
use crate::store::{Entry, ENDPOINT_KEY_PREFIX, NETWORK_KEY_PREFIX};
use crate::watch::TreeWatch;

/// Supervisor name of the network collection watch.
pub(crate) const NETWORK_WATCH: &str = "networks";

/// Supervisor name of a network's endpoint watch.
pub(crate) fn endpoint_watch_name(network_id: &str) -> String {
    format!("endpoints/{}", network_id)
}

impl Controller {
    /// Start following the global network collection, once.
    pub(crate) fn watch_networks(&self) -> Result<()> {
        let Some(store) = self.global_store() else {
            return Ok(());
        };
        if self.supervisor.is_running(NETWORK_WATCH) {
            trace!("network watch already running");
            return Ok(());
        }

        let cancel = CancellationToken::new();
        let snapshots = store.watch_tree(&[NETWORK_KEY_PREFIX], cancel.clone())?;
        let weak = self.weak_self.clone();
        let loop_cancel = cancel.clone();
        self.supervisor.spawn(NETWORK_WATCH, cancel, async move {
            run_watch(loop_cancel, snapshots, |entries| {
                let weak = weak.clone();
                async move { reconcile_network_snapshot(&weak, entries).await }
            })
            .await
        });
        Ok(())
    }

    /// Start following the endpoints of a global network.
    ///
    /// Does nothing for local networks, without a global store, or when the
    /// network already has a watch armed.
    pub fn start_endpoint_watch(&self, network: &Arc<Network>) -> Result<()> {
        if !network.is_global_scoped() {
            return Ok(());
        }
        let Some(store) = self.global_store() else {
            return Ok(());
        };
        let Some(cancel) = network.arm_watch() else {
            trace!(network = %network.id(), "endpoint watch already armed");
            return Ok(());
        };

        let prefix = [ENDPOINT_KEY_PREFIX, network.id()];
        let snapshots = match store.watch_tree(&prefix, cancel.clone()) {
            Ok(snapshots) => snapshots,
            Err(err) => {
                network.disarm_watch();
                return Err(err);
            }
        };

        let weak = self.weak_self.clone();
        let network_id = network.id().to_string();
        let loop_cancel = cancel.clone();
        let started = self
            .supervisor
            .spawn(endpoint_watch_name(network.id()), cancel, async move {
                run_watch(loop_cancel, snapshots, |entries| {
                    let weak = weak.clone();
                    let network_id = network_id.clone();
                    async move { reconcile_endpoint_snapshot(&weak, &network_id, entries).await }
                })
                .await
            });
        if !started {
            network.disarm_watch();
        }
        Ok(())
    }

    /// Stop a network's endpoint watch and wait for it to exit.
    ///
    /// Stopping an unwatched network is a no-op.
    pub async fn stop_endpoint_watch(&self, network: &Network) {
        let disarmed = network.disarm_watch();
        let stopped = self.supervisor.stop(&endpoint_watch_name(network.id())).await;
        if disarmed || stopped {
            debug!(network = %network.id(), "endpoint watch stopped");
        }
    }

    /// Live networks a global network snapshot may prune.
    ///
    /// Only persisted global networks: local ones live in the other store
    /// and ephemeral ones are never written.
    pub fn network_prune_candidates(&self) -> HashMap<String, Arc<Network>> {
        self.networks
            .snapshot_filtered(|n| n.scope() == DataScope::Global && !n.skip())
    }

    /// Whether the network collection watch is running.
    pub fn is_watching_networks(&self) -> bool {
        self.supervisor.is_running(NETWORK_WATCH)
    }
}

/// Drive a snapshot stream until cancelled.
///
/// `apply` returns false once the controller is gone. A stream that ends
/// without cancellation is reported as a failure.
async fn run_watch<F, Fut>(cancel: CancellationToken, mut snapshots: TreeWatch, mut apply: F) -> Result<()>
where
    F: FnMut(Vec<Entry>) -> Fut,
    Fut: Future<Output = bool>,
{
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            snapshot = snapshots.next() => match snapshot {
                Some(entries) => {
                    if !apply(entries).await {
                        debug!(prefix = %snapshots.prefix(), "controller dropped, ending watch");
                        return Ok(());
                    }
                }
                None if cancel.is_cancelled() => return Ok(()),
                None => return Err(StateError::WatchClosed(snapshots.prefix().to_string())),
            },
        }
    }
}

async fn reconcile_network_snapshot(weak: &Weak<Controller>, entries: Vec<Entry>) -> bool {
    let Some(controller) = weak.upgrade() else {
        return false;
    };
    let prune = controller.network_prune_candidates();
    let report = controller.reconcile_networks(&entries, Some(prune)).await;
    if report.changed() {
        debug!(?report, "network snapshot applied");
    } else {
        trace!(?report, "network snapshot applied");
    }
    true
}

async fn reconcile_endpoint_snapshot(
    weak: &Weak<Controller>,
    network_id: &str,
    entries: Vec<Entry>,
) -> bool {
    let Some(controller) = weak.upgrade() else {
        return false;
    };
    let Ok(network) = controller.network_by_id(network_id) else {
        // Removed between the snapshot and now; its watch is being stopped.
        return true;
    };
    let prune: HashMap<_, _> = network
        .endpoint_table()
        .snapshot_filtered(|ep| ep.data_scope() == DataScope::Global && !ep.skip());
    let report = controller.reconcile_endpoints(&entries, Some(prune)).await;
    if report.changed() {
        debug!(network = %network_id, ?report, "endpoint snapshot applied");
    } else {
        trace!(network = %network_id, ?report, "endpoint snapshot applied");
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::MemoryStore;
    use crate::network::NetworkOptions;

    async fn controller(global: bool) -> Arc<Controller> {
        let mut builder =
            Controller::builder(Config::default()).local_store(Arc::new(MemoryStore::new()));
        if global {
            builder = builder.global_store(Arc::new(MemoryStore::new()));
        }
        builder.build().await.unwrap()
    }

    #[test]
    fn test_watch_names() {
        assert_eq!(endpoint_watch_name("n1"), "endpoints/n1");
        assert_ne!(endpoint_watch_name("n1"), NETWORK_WATCH);
    }

    #[tokio::test]
    async fn test_network_watch_follows_global_store() {
        let controller = controller(true).await;
        assert!(controller.is_watching_networks());
        // Bootstrapping again does not start a second watch.
        controller.bootstrap(DataScope::Global).await.unwrap();
        assert_eq!(controller.active_watches(), vec![NETWORK_WATCH.to_string()]);
        controller.shutdown().await;
        assert!(!controller.is_watching_networks());
    }

    #[tokio::test]
    async fn test_no_watches_without_global_store() {
        let controller = controller(false).await;
        assert!(!controller.is_watching_networks());
        let network = controller
            .new_network("ov", "overlay", NetworkOptions::scoped(DataScope::Global))
            .await
            .unwrap();
        assert!(!network.is_watching());
        assert!(controller.active_watches().is_empty());
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_endpoint_watch_start_stop() {
        let controller = controller(true).await;
        let network = controller
            .new_network("ov", "overlay", NetworkOptions::scoped(DataScope::Global))
            .await
            .unwrap();
        let name = endpoint_watch_name(network.id());
        assert!(network.is_watching());
        assert!(controller.supervisor.is_running(&name));

        // Starting again keeps the single running watch.
        controller.start_endpoint_watch(&network).unwrap();
        assert_eq!(
            controller.active_watches(),
            vec![name.clone(), NETWORK_WATCH.to_string()]
        );

        controller.stop_endpoint_watch(&network).await;
        assert!(!network.is_watching());
        assert!(!controller.supervisor.is_running(&name));
        controller.stop_endpoint_watch(&network).await;

        controller.shutdown().await;
        assert!(controller.watch_failures().is_empty());
    }

    #[tokio::test]
    async fn test_local_network_never_watched() {
        let controller = controller(true).await;
        let network = controller
            .new_network("br", "bridge", NetworkOptions::default())
            .await
            .unwrap();
        controller.start_endpoint_watch(&network).unwrap();
        assert!(!network.is_watching());
        controller.shutdown().await;
    }
}
