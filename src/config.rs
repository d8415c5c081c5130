//! Configuration System
//!
//! Layered runtime configuration: built-in defaults, then global and
//! working-directory TOML files, then an explicit file, then `COURIER_*`
//! environment variables. Every section also carries serde defaults so a
//! partial file is always complete once loaded.

use crate::batcher::BatchConfig;
use crate::logging::LoggingConfig;
use crate::watch::WatchConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Per-call timeout unless a request overrides it
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default)]
    pub user_agent: Option<String>,
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            user_agent: None,
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Lookup cache and persisted catalog expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Lookup cache TTL; zero or negative disables expiry
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: i64,

    #[serde(default = "default_cache_max_size")]
    pub max_size: Option<usize>,

    /// Persisted catalog TTL; zero or negative disables expiry
    #[serde(default = "default_catalog_ttl_ms")]
    pub catalog_ttl_ms: i64,
}

fn default_cache_ttl_ms() -> i64 {
    5 * 60 * 1000
}

fn default_cache_max_size() -> Option<usize> {
    Some(500)
}

fn default_catalog_ttl_ms() -> i64 {
    6 * 60 * 60 * 1000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_cache_ttl_ms(),
            max_size: default_cache_max_size(),
            catalog_ttl_ms: default_catalog_ttl_ms(),
        }
    }
}

/// Host adapter selection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    /// Sled database path; an in-memory host is used when unset
    #[serde(default)]
    pub storage_path: Option<PathBuf>,

    /// Origins network handlers may reach; `"*"` grants all
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Messages buffered between the two sides
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    crate::transport::DEFAULT_CAPACITY
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Fetch(String),
    Cache(String),
    Batch(String),
    Watch(String),
    Host(String),
    Transport(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Fetch(msg) => write!(f, "fetch: {}", msg),
            ValidationError::Cache(msg) => write!(f, "cache: {}", msg),
            ValidationError::Batch(msg) => write!(f, "batch: {}", msg),
            ValidationError::Watch(msg) => write!(f, "watch: {}", msg),
            ValidationError::Host(msg) => write!(f, "host: {}", msg),
            ValidationError::Transport(msg) => write!(f, "transport: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CourierConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if self.fetch.timeout_ms == 0 {
            errors.push(ValidationError::Fetch("timeout_ms must be positive".to_string()));
        }
        if self.cache.max_size == Some(0) {
            errors.push(ValidationError::Cache(
                "max_size must be positive when set".to_string(),
            ));
        }
        if self.batch.max_batch == 0 {
            errors.push(ValidationError::Batch("max_batch must be positive".to_string()));
        }
        if self.watch.interval_ms == 0 {
            errors.push(ValidationError::Watch("interval_ms must be positive".to_string()));
        }
        for origin in &self.host.allowed_origins {
            if origin != "*" && !origin.contains("://") {
                errors.push(ValidationError::Host(format!(
                    "allowed origin '{}' must include a scheme",
                    origin
                )));
            }
        }
        if self.transport.capacity == 0 {
            errors.push(ValidationError::Transport(
                "capacity must be positive".to_string(),
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
