//! # netstate
//!
//! Persistence and replication of network state over versioned key-value
//! stores.
//!
//! A [`Controller`] keeps a live table of networks and their endpoints and
//! persists them to one of two stores:
//!
//! - **Local**: always present, private to this node ([`SqliteStore`] by default)
//! - **Global**: optional, shared by every node of a cluster
//!
//! Writes use compare-and-swap on per-key versions, so a stale copy never
//! overwrites a newer one. Changes other nodes make to the global store are
//! replicated through tree watches: each snapshot is upserted into the live
//! tables, and objects missing from it are removed only after a re-read
//! confirms they are gone.
//!
//! ## Backends
//!
//! - [`SqliteStore`]: Embedded SQLite database (default local store)
//! - [`MemoryStore`]: In-memory store (testing, or a process-wide global store)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netstate::{Config, Controller, DataScope, MemoryStore, NetworkOptions};
//!
//! #[tokio::main]
//! async fn main() -> netstate::Result<()> {
//!     let controller = Controller::builder(Config::default())
//!         .local_store(Arc::new(MemoryStore::new()))
//!         .global_store(Arc::new(MemoryStore::new()))
//!         .build()
//!         .await?;
//!
//!     let network = controller
//!         .new_network("overlay0", "overlay", NetworkOptions::scoped(DataScope::Global))
//!         .await?;
//!     let endpoint = controller.new_endpoint(network.id(), "web").await?;
//!     controller.join_endpoint(&endpoint, "sandbox-1").await?;
//!
//!     controller.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [local_store]
//! provider = "sqlite"
//! address = "/var/lib/netstate/local-kv.db"
//!
//! [global_store]
//! provider = "memory"
//! address = "cluster"
//!
//! [watch]
//! snapshot_capacity = 16
//! ```

pub mod config;
pub mod controller;
pub mod datastore;
pub mod endpoint;
pub mod error;
pub mod memory;
pub mod network;
pub mod reconcile;
pub mod sqlite;
pub mod store;
pub mod supervisor;
pub mod table;
pub mod watch;
mod watch_loop;

// Re-export main types
pub use config::{Config, StoreConfig, WatchConfig};
pub use controller::{Controller, ControllerBuilder};
pub use datastore::{DataScope, DataStore, KvObject};
pub use endpoint::Endpoint;
pub use error::{Result, StateError};
pub use memory::MemoryStore;
pub use network::{Network, NetworkOptions};
pub use reconcile::{ReconcileReport, RemoteUpdate};
pub use sqlite::SqliteStore;
pub use store::{Entry, KvStore, MAX_KEY_LENGTH};
pub use supervisor::WatchFailure;
pub use watch::{EventType, TreeWatch, WatchEvent, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::controller::Controller;
    pub use crate::datastore::{DataScope, KvObject};
    pub use crate::error::{Result, StateError};
    pub use crate::memory::MemoryStore;
    pub use crate::network::NetworkOptions;
    pub use crate::sqlite::SqliteStore;
    pub use crate::store::{Entry, KvStore};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_basic() {
        let store = MemoryStore::new();

        let version = store.put("/netstate/v1/network/n1", b"value".to_vec(), 0).await.unwrap();
        let entry = store.get("/netstate/v1/network/n1").await.unwrap().unwrap();
        assert_eq!(entry.value, b"value");
        assert_eq!(entry.version, version);
    }

    #[test]
    fn test_types_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}

        assert_send_sync::<MemoryStore>();
        assert_send_sync::<SqliteStore>();
        assert_send_sync::<Controller>();
        assert_send_sync::<Network>();
        assert_send_sync::<Endpoint>();
    }
}
