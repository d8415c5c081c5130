//! Key-based storage
//!
//! A minimal key/value contract plus typed accessors for the three namespaced
//! keys the privileged side owns. Reads always yield a default-shaped value.

use crate::error::StorageError;
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::warn;

pub const SETTINGS_KEY: &str = "courier.settings";
pub const CATALOG_KEY: &str = "courier.catalog";
pub const SELECTIONS_KEY: &str = "courier.selections";

/// Raw key/value storage
pub trait KeyValueStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError>;
    fn write(&self, key: &str, value: &Value) -> Result<(), StorageError>;
}

/// Sled-backed persistent store
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open (or create) a sled database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)
            .map_err(|e| StorageError::Backend(format!("Failed to open sled database: {}", e)))?;
        Ok(Self { db })
    }
}

impl KeyValueStore for SledStore {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        match self.db.get(key.as_bytes())? {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => Ok(Some(value)),
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable stored value");
                    Ok(None)
                }
            },
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.db.insert(key.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.values.read().get(key).cloned())
    }

    fn write(&self, key: &str, value: &Value) -> Result<(), StorageError> {
        self.values.write().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// User-editable settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default)]
    pub service_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    10_000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            api_key: String::new(),
            enabled: default_enabled(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Settings {
    pub fn is_configured(&self) -> bool {
        !self.service_url.trim().is_empty()
    }

    /// Join a path onto the configured service URL
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.service_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

/// Persisted catalog snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogCache {
    #[serde(default)]
    pub items: Vec<Value>,
    /// Milliseconds since the epoch; zero when never stored
    #[serde(default)]
    pub stored_at_ms: i64,
}

impl CatalogCache {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            items,
            stored_at_ms: Utc::now().timestamp_millis(),
        }
    }

    /// Whether the snapshot is still fresh. A non-positive TTL never expires.
    pub fn is_fresh(&self, ttl_ms: i64, now_ms: i64) -> bool {
        if self.stored_at_ms == 0 {
            return false;
        }
        ttl_ms <= 0 || now_ms - self.stored_at_ms <= ttl_ms
    }
}

/// User selections and exclusions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Selections {
    #[serde(default)]
    pub selected: BTreeMap<String, Value>,
    #[serde(default)]
    pub excluded: BTreeSet<String>,
}

/// Typed view over the three namespaced keys
pub struct Stores<'a> {
    store: &'a dyn KeyValueStore,
}

impl<'a> Stores<'a> {
    pub fn new(store: &'a dyn KeyValueStore) -> Self {
        Self { store }
    }

    fn read_or_default<T: DeserializeOwned + Default>(&self, key: &str) -> Result<T, StorageError> {
        match self.store.read(key)? {
            Some(value) => match serde_json::from_value(value) {
                Ok(parsed) => Ok(parsed),
                Err(e) => {
                    warn!(key, error = %e, "Stored value has unexpected shape; using defaults");
                    Ok(T::default())
                }
            },
            None => Ok(T::default()),
        }
    }

    fn write_typed<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let encoded = serde_json::to_value(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.store.write(key, &encoded)
    }

    pub fn settings(&self) -> Result<Settings, StorageError> {
        self.read_or_default(SETTINGS_KEY)
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<(), StorageError> {
        self.write_typed(SETTINGS_KEY, settings)
    }

    pub fn catalog(&self) -> Result<CatalogCache, StorageError> {
        self.read_or_default(CATALOG_KEY)
    }

    pub fn save_catalog(&self, catalog: &CatalogCache) -> Result<(), StorageError> {
        self.write_typed(CATALOG_KEY, catalog)
    }

    pub fn selections(&self) -> Result<Selections, StorageError> {
        self.read_or_default(SELECTIONS_KEY)
    }

    pub fn save_selections(&self, selections: &Selections) -> Result<(), StorageError> {
        self.write_typed(SELECTIONS_KEY, selections)
    }
}
