//! Host capability
//!
//! The privileged side reaches storage and origin permissions through one
//! abstract [`Host`]. Exactly one adapter is chosen at startup by [`select`].

use crate::config::HostConfig;
use crate::error::StorageError;
use crate::store::{KeyValueStore, MemoryStore, SledStore};
use std::sync::Arc;
use tracing::info;

pub trait Host: Send + Sync {
    fn name(&self) -> &str;

    fn store(&self) -> &dyn KeyValueStore;

    /// Whether network access to `origin` (`scheme://host[:port]`) is granted
    fn permits(&self, origin: &str) -> bool;
}

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed
        .iter()
        .any(|entry| entry == "*" || entry.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

/// Host backed by a sled database on disk
pub struct LocalHost {
    store: SledStore,
    allowed_origins: Vec<String>,
}

impl LocalHost {
    pub fn new(store: SledStore, allowed_origins: Vec<String>) -> Self {
        Self {
            store,
            allowed_origins,
        }
    }
}

impl Host for LocalHost {
    fn name(&self) -> &str {
        "local"
    }

    fn store(&self) -> &dyn KeyValueStore {
        &self.store
    }

    fn permits(&self, origin: &str) -> bool {
        origin_allowed(&self.allowed_origins, origin)
    }
}

/// Ephemeral host
pub struct MemoryHost {
    store: MemoryStore,
    allowed_origins: Vec<String>,
}

impl MemoryHost {
    pub fn new(allowed_origins: Vec<String>) -> Self {
        Self {
            store: MemoryStore::new(),
            allowed_origins,
        }
    }

    /// Memory host that grants every origin
    pub fn permissive() -> Self {
        Self::new(vec!["*".to_string()])
    }
}

impl Host for MemoryHost {
    fn name(&self) -> &str {
        "memory"
    }

    fn store(&self) -> &dyn KeyValueStore {
        &self.store
    }

    fn permits(&self, origin: &str) -> bool {
        origin_allowed(&self.allowed_origins, origin)
    }
}

/// Pick the host adapter for this process
pub fn select(config: &HostConfig) -> Result<Arc<dyn Host>, StorageError> {
    let host: Arc<dyn Host> = match &config.storage_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(LocalHost::new(
                SledStore::open(path)?,
                config.allowed_origins.clone(),
            ))
        }
        None => Arc::new(MemoryHost::new(config.allowed_origins.clone())),
    };
    info!(host = host.name(), "Host capability selected");
    Ok(host)
}
