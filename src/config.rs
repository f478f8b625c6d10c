//! Store configuration.
//!
//! Configuration is loaded from TOML:
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
//! event_capacity = 1024
//! snapshot_capacity = 16
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::{Result, StateError};
use crate::memory::MemoryStore;
use crate::sqlite::SqliteStore;
use crate::store::KvStore;
use crate::watch::{DEFAULT_EVENT_CAPACITY, DEFAULT_SNAPSHOT_CAPACITY};

/// Path of the embedded local store when none is configured.
pub const DEFAULT_LOCAL_STORE_PATH: &str = "/var/lib/netstate/local-kv.db";

/// Provider name of the embedded SQLite backend.
pub const PROVIDER_SQLITE: &str = "sqlite";

/// Provider name of the in-process memory backend.
pub const PROVIDER_MEMORY: &str = "memory";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local (single node) store. Falls back to the embedded default.
    #[serde(default)]
    pub local_store: Option<StoreConfig>,

    /// Global (cluster-wide) store. Absent means local-only operation.
    #[serde(default)]
    pub global_store: Option<StoreConfig>,

    /// Watch channel sizing.
    #[serde(default)]
    pub watch: WatchConfig,
}

/// Client parameters for one key-value store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend name, `sqlite` or `memory`.
    #[serde(default)]
    pub provider: String,

    /// Backend address; a file path for `sqlite`.
    #[serde(default)]
    pub address: String,
}

impl StoreConfig {
    /// Create a store configuration.
    pub fn new(provider: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            address: address.into(),
        }
    }

    /// The embedded SQLite store used when no local store is configured.
    pub fn default_local() -> Self {
        Self::new(PROVIDER_SQLITE, DEFAULT_LOCAL_STORE_PATH)
    }

    /// Whether both provider and address are set.
    pub fn is_valid(&self) -> bool {
        !self.provider.is_empty() && !self.address.is_empty()
    }

    /// Open the backend this configuration describes.
    pub async fn open(&self, watch: &WatchConfig) -> Result<Arc<dyn KvStore>> {
        match self.provider.as_str() {
            PROVIDER_SQLITE => Ok(Arc::new(
                SqliteStore::open_with_event_capacity(&self.address, watch.event_capacity).await?,
            )),
            PROVIDER_MEMORY => Ok(Arc::new(MemoryStore::with_event_capacity(
                watch.event_capacity,
            ))),
            other => Err(StateError::InvalidConfig(format!(
                "unsupported store provider {:?}",
                other
            ))),
        }
    }
}

/// Watch channel sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Per-key events buffered by a backend before subscribers lag.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Snapshots buffered per tree watch.
    #[serde(default = "default_snapshot_capacity")]
    pub snapshot_capacity: usize,
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

fn default_snapshot_capacity() -> usize {
    DEFAULT_SNAPSHOT_CAPACITY
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
            snapshot_capacity: default_snapshot_capacity(),
        }
    }
}

impl Config {
    /// Parse configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_toml_str(&content)
    }

    /// Reject settings no controller could run with.
    pub fn validate(&self) -> Result<()> {
        if self.watch.snapshot_capacity == 0 || self.watch.event_capacity == 0 {
            return Err(StateError::InvalidConfig(
                "watch capacities must be greater than zero".to_string(),
            ));
        }
        if let Some(global) = &self.global_store {
            if !global.provider.is_empty() && global.address.is_empty() {
                return Err(StateError::InvalidConfig(format!(
                    "global store provider {} requires an address",
                    global.provider
                )));
            }
        }
        Ok(())
    }

    /// The local store configuration, or the embedded default.
    pub fn local_store_config(&self) -> StoreConfig {
        match &self.local_store {
            Some(cfg) if cfg.is_valid() => cfg.clone(),
            _ => StoreConfig::default_local(),
        }
    }

    /// The global store configuration, if one is usable.
    pub fn global_store_config(&self) -> Option<&StoreConfig> {
        self.global_store.as_ref().filter(|cfg| cfg.is_valid())
    }
}
