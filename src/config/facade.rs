//! ConfigLoader: assembles sources in precedence order and deserializes.

use super::merge;
use super::sources::{env, global_file, workspace_file};
use super::CourierConfig;
use crate::error::RuntimeError;
use config::File;
use std::path::Path;
use tracing::debug;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a run rooted at `root`
    ///
    /// Precedence (highest last): defaults, global file, `root/courier.toml`,
    /// `root/courier.{COURIER_ENV}.toml`, `explicit`, environment.
    pub fn load(root: &Path, explicit: Option<&Path>) -> Result<CourierConfig, RuntimeError> {
        let mut builder = merge::builder_with_defaults()?;
        builder = global_file::add_to_builder(builder)?;
        builder = workspace_file::add_to_builder(builder, root)?;

        if let Some(path) = explicit {
            if !path.exists() {
                return Err(RuntimeError::Config(format!(
                    "Config file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }
        builder = env::add_to_builder(builder);

        let config: CourierConfig = builder.build()?.try_deserialize()?;
        debug!(?config, "Configuration loaded");
        Self::validated(config)
    }

    /// Load a single file on top of defaults, ignoring other sources
    pub fn load_from_file(path: &Path) -> Result<CourierConfig, RuntimeError> {
        let config: CourierConfig = merge::builder_with_defaults()?
            .add_source(File::from(path.to_path_buf()).required(true))
            .build()?
            .try_deserialize()?;
        Self::validated(config)
    }

    /// Render the effective configuration as TOML
    pub fn render(config: &CourierConfig) -> Result<String, RuntimeError> {
        toml::to_string_pretty(config)
            .map_err(|e| RuntimeError::Config(format!("Failed to render config: {}", e)))
    }

    fn validated(config: CourierConfig) -> Result<CourierConfig, RuntimeError> {
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            RuntimeError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
