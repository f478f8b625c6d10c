//! End-to-end persistence and replication through shared stores.

mod common;

use common::{controller_with, durable_controller, wait_for};
use netstate::store::key;
use netstate::{
    DataScope, KvObject, KvStore, MemoryStore, Network, NetworkOptions, SqliteStore, StateError,
};
use std::collections::HashMap;
use std::sync::Arc;

#[tokio::test]
async fn test_versions_strictly_increase_across_keys() {
    let memory = MemoryStore::new();
    let sqlite = SqliteStore::in_memory().await.unwrap();
    let stores: [&dyn KvStore; 2] = [&memory, &sqlite];

    for store in stores {
        let a = key(&["network", "a"]);
        let b = key(&["network", "b"]);

        let v1 = store.put(&a, b"1".to_vec(), 0).await.unwrap();
        let v2 = store.put(&b, b"1".to_vec(), 0).await.unwrap();
        let v3 = store.put(&a, b"2".to_vec(), v1).await.unwrap();
        assert!(v1 < v2 && v2 < v3);

        // A stale copy can neither overwrite nor delete.
        let err = store.put(&a, b"stale".to_vec(), v1).await.unwrap_err();
        assert!(matches!(err, StateError::VersionConflict { .. }));
        let err = store.delete(&a, v1).await.unwrap_err();
        assert!(matches!(err, StateError::VersionConflict { .. }));

        store.delete(&a, v3).await.unwrap();
        let v4 = store.put(&a, b"again".to_vec(), 0).await.unwrap();
        assert!(v4 > v3);
    }
}

#[tokio::test]
async fn test_no_global_store_is_silent_noop() {
    let controller = controller_with(None).await;

    let network = controller
        .new_network("ov", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    assert!(!network.exists());
    assert_eq!(network.index(), 0);
    assert!(!network.is_watching());

    let endpoint = controller.new_endpoint(network.id(), "web").await.unwrap();
    assert!(!endpoint.exists());
    controller.join_endpoint(&endpoint, "sb").await.unwrap();
    assert_eq!(endpoint.sandbox_id().as_deref(), Some("sb"));

    controller.delete_endpoint(network.id(), endpoint.id()).await.unwrap();
    controller.delete_network(network.id()).await.unwrap();
    assert!(controller.networks().is_empty());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_local_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("local-kv.db");

    let (network_id, endpoint_id, network_index, endpoint_index) = {
        let controller = durable_controller(&path, None).await;
        let network = controller
            .new_network("br0", "bridge", NetworkOptions::default().label("tier", "web"))
            .await
            .unwrap();
        let endpoint = controller.new_endpoint(network.id(), "web").await.unwrap();
        controller.join_endpoint(&endpoint, "sandbox-1").await.unwrap();

        assert!(network.index() > 0);
        assert!(endpoint.index() > 0);
        let ids = (
            network.id().to_string(),
            endpoint.id().to_string(),
            network.index(),
            endpoint.index(),
        );
        controller.shutdown().await;
        ids
    };

    let controller = durable_controller(&path, None).await;
    let network = controller.network_by_name("br0").unwrap();
    assert_eq!(network.id(), network_id);
    assert_eq!(network.index(), network_index);
    assert_eq!(network.endpoint_count(), 1);
    assert_eq!(network.labels().get("tier").map(String::as_str), Some("web"));

    let endpoint = network.endpoint_by_id(&endpoint_id).unwrap();
    assert_eq!(endpoint.index(), endpoint_index);
    assert_eq!(endpoint.sandbox_id().as_deref(), Some("sandbox-1"));

    // The restored copies carry the stored versions, so they can be updated.
    controller.leave_endpoint(&endpoint).await.unwrap();
    assert!(endpoint.index() > endpoint_index);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let controller = durable_controller(&dir.path().join("kv.db"), None).await;
    let network = controller
        .new_network("br0", "bridge", NetworkOptions::default())
        .await
        .unwrap();
    let endpoint = controller.new_endpoint(network.id(), "ep").await.unwrap();
    let (network_index, endpoint_index) = (network.index(), endpoint.index());

    controller.bootstrap(DataScope::Local).await.unwrap();
    controller.bootstrap(DataScope::Global).await.unwrap();

    assert_eq!(controller.networks().len(), 1);
    let again = controller.network_by_id(network.id()).unwrap();
    assert!(Arc::ptr_eq(&again, &network));
    assert_eq!(again.index(), network_index);
    assert_eq!(again.endpoints().len(), 1);
    assert!(Arc::ptr_eq(&again.endpoint_by_id(endpoint.id()).unwrap(), &endpoint));
    assert_eq!(endpoint.index(), endpoint_index);
    controller.shutdown().await;
}

#[tokio::test]
async fn test_scopes_are_isolated() {
    let global = Arc::new(MemoryStore::new());
    let a = controller_with(Some(global.clone())).await;
    let b = controller_with(Some(global.clone())).await;

    let local = a
        .new_network("br0", "bridge", NetworkOptions::default())
        .await
        .unwrap();
    let shared = a
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();

    let local_key = key(&local.key());
    let shared_key = key(&shared.key());
    assert!(a.local_store().kv_store().get(&local_key).await.unwrap().is_some());
    assert!(global.get(&local_key).await.unwrap().is_none());
    assert!(global.get(&shared_key).await.unwrap().is_some());
    assert!(a.local_store().kv_store().get(&shared_key).await.unwrap().is_none());

    wait_for("global network on b", || b.network_by_id(shared.id()).is_ok()).await;
    assert!(matches!(
        b.network_by_id(local.id()),
        Err(StateError::NoSuchNetwork(_))
    ));
    assert!(!local.is_watching());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_endpoint_watch_lifecycle() {
    let global = Arc::new(MemoryStore::new());
    let controller = controller_with(Some(global)).await;
    let network = controller
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    let watch_name = format!("endpoints/{}", network.id());

    assert!(network.is_watching());
    assert!(controller.active_watches().contains(&watch_name));

    controller.stop_endpoint_watch(&network).await;
    assert!(!network.is_watching());
    assert!(!controller.active_watches().contains(&watch_name));

    // Stopping again is a no-op; starting again re-arms.
    controller.stop_endpoint_watch(&network).await;
    controller.start_endpoint_watch(&network).unwrap();
    assert!(network.is_watching());
    assert!(controller.active_watches().contains(&watch_name));

    controller.shutdown().await;
    assert!(!network.is_watching());
    assert!(controller.active_watches().is_empty());
    assert!(controller.watch_failures().is_empty());
}

#[tokio::test]
async fn test_missing_from_snapshot_but_stored_is_retained() {
    let global = Arc::new(MemoryStore::new());
    let controller = controller_with(Some(global)).await;
    let network = controller
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    let endpoint = controller.new_endpoint(network.id(), "web").await.unwrap();

    let prune: HashMap<_, _> = network
        .endpoints()
        .into_iter()
        .map(|ep| (ep.id().to_string(), ep))
        .collect();
    let report = controller.reconcile_endpoints(&[], Some(prune)).await;

    assert_eq!(report.deleted, 0);
    assert_eq!(report.retained, 1);
    assert!(network.endpoint_by_id(endpoint.id()).is_ok());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_externally_deleted_endpoint_removed() {
    let global = Arc::new(MemoryStore::new());
    let controller = controller_with(Some(global.clone())).await;
    let network = controller
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    let endpoint = controller.new_endpoint(network.id(), "web").await.unwrap();

    let endpoint_key = key(&endpoint.key());
    let stored = global.get(&endpoint_key).await.unwrap().unwrap();
    global.delete(&endpoint_key, stored.version).await.unwrap();

    wait_for("endpoint removal", || network.endpoint_by_id(endpoint.id()).is_err()).await;
    assert!(controller.network_by_id(network.id()).is_ok());
    controller.shutdown().await;
}

#[tokio::test]
async fn test_two_controllers_converge() {
    let global = Arc::new(MemoryStore::new());
    let a = controller_with(Some(global.clone())).await;
    let b = controller_with(Some(global.clone())).await;

    let network = a
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    wait_for("network on b", || b.network_by_id(network.id()).is_ok()).await;
    let remote_network = b.network_by_id(network.id()).unwrap();
    assert_eq!(remote_network.name(), "ov0");
    assert!(remote_network.is_watching());

    let endpoint = a.new_endpoint(network.id(), "web").await.unwrap();
    wait_for("endpoint on b", || remote_network.endpoint_by_id(endpoint.id()).is_ok()).await;
    wait_for("endpoint count on b", || remote_network.endpoint_count() == 1).await;

    a.join_endpoint(&endpoint, "sandbox-1").await.unwrap();
    wait_for("sandbox on b", || {
        remote_network
            .endpoint_by_id(endpoint.id())
            .map(|ep| ep.sandbox_id().as_deref() == Some("sandbox-1"))
            .unwrap_or(false)
    })
    .await;

    a.delete_endpoint(network.id(), endpoint.id()).await.unwrap();
    wait_for("endpoint removal on b", || remote_network.endpoint_by_id(endpoint.id()).is_err()).await;
    wait_for("endpoint count on b", || remote_network.endpoint_count() == 0).await;

    a.delete_network(network.id()).await.unwrap();
    wait_for("network removal on b", || b.network_by_id(network.id()).is_err()).await;
    assert!(!remote_network.is_watching());

    a.shutdown().await;
    b.shutdown().await;
    assert!(a.watch_failures().is_empty());
    assert!(b.watch_failures().is_empty());
}

#[tokio::test]
async fn test_late_joiner_bootstraps_global_state() {
    let global = Arc::new(MemoryStore::new());
    let a = controller_with(Some(global.clone())).await;
    let network = a
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();
    let endpoint = a.new_endpoint(network.id(), "web").await.unwrap();

    let b = controller_with(Some(global)).await;
    let remote_network = b.network_by_id(network.id()).unwrap();
    assert_eq!(remote_network.index(), network.index());
    wait_for("endpoint on late joiner", || {
        remote_network.endpoint_by_id(endpoint.id()).is_ok()
    })
    .await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_only_persisted_global_networks_are_prune_candidates() {
    let global = Arc::new(MemoryStore::new());
    let controller = controller_with(Some(global.clone())).await;

    let local = controller
        .new_network("br0", "bridge", NetworkOptions::default())
        .await
        .unwrap();
    let ephemeral = controller
        .new_network(
            "ov-tmp",
            "overlay",
            NetworkOptions::scoped(DataScope::Global).ephemeral(),
        )
        .await
        .unwrap();
    let shared = controller
        .new_network("ov0", "overlay", NetworkOptions::scoped(DataScope::Global))
        .await
        .unwrap();

    let candidates = controller.network_prune_candidates();
    assert_eq!(candidates.len(), 1);
    assert!(candidates.contains_key(shared.id()));

    // A global snapshot never turns local or ephemeral networks into candidates.
    let snapshot = global.list("/netstate/v1/network/").await.unwrap();
    assert_eq!(snapshot.len(), 1);
    let report = controller
        .reconcile_networks(&snapshot, Some(controller.network_prune_candidates()))
        .await;
    assert_eq!(report.unchanged, 1);
    assert_eq!(report.retained, 0);
    assert_eq!(report.deleted, 0);

    // Two writes from another node: once the second is applied, the live
    // watch has fully processed the snapshot of the first.
    for name in ["remote-a", "remote-b"] {
        let remote = Network::new(name, "overlay", NetworkOptions::scoped(DataScope::Global));
        global
            .put(&key(&remote.key()), remote.value().unwrap(), 0)
            .await
            .unwrap();
        wait_for("remote network", || controller.network_by_id(remote.id()).is_ok()).await;
    }

    assert!(Arc::ptr_eq(&controller.network_by_id(local.id()).unwrap(), &local));
    assert!(Arc::ptr_eq(&controller.network_by_id(ephemeral.id()).unwrap(), &ephemeral));
    assert!(Arc::ptr_eq(&controller.network_by_id(shared.id()).unwrap(), &shared));
    assert_eq!(controller.networks().len(), 5);
    controller.shutdown().await;
}
