//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use netstate::{Config, Controller, KvStore, MemoryStore, SqliteStore};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// How long a watch gets to replicate a change.
pub const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("netstate=warn")),
        )
        .with_test_writer()
        .try_init();
}

/// A controller with an in-memory local store and the given global store.
pub async fn controller_with(global: Option<Arc<MemoryStore>>) -> Arc<Controller> {
    init_tracing();
    let mut builder =
        Controller::builder(Config::default()).local_store(Arc::new(MemoryStore::new()));
    if let Some(global) = global {
        builder = builder.global_store(global as Arc<dyn KvStore>);
    }
    builder.build().await.expect("controller should start")
}

/// A controller whose local store is a SQLite file at `path`.
pub async fn durable_controller(path: &Path, global: Option<Arc<MemoryStore>>) -> Arc<Controller> {
    init_tracing();
    let local = SqliteStore::open(path).await.expect("sqlite store should open");
    let mut builder = Controller::builder(Config::default()).local_store(Arc::new(local));
    if let Some(global) = global {
        builder = builder.global_store(global as Arc<dyn KvStore>);
    }
    builder.build().await.expect("controller should start")
}

/// Poll `cond` until it holds or the timeout expires.
pub async fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    loop {
        if cond() {
            return;
        }
        if start.elapsed() > CONVERGE_TIMEOUT {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
