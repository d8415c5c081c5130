//! Merge rules: defaults, override order, conflict handling.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("fetch.timeout_ms", 10_000)?
        .set_default("fetch.connect_timeout_ms", 10_000)?
        .set_default("batch.max_batch", 25)?
        .set_default("batch.max_wait_ms", 50)?
        .set_default("watch.debounce_ms", 150)?
        .set_default("watch.interval_ms", 500)
}
