//! CLI command implementations.

pub mod check;
pub mod demo;

pub use check::check_config;
pub use demo::{demo_broadcast, demo_hierarchy};

use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;
use troupe::{Runtime, RuntimeBuilder, RuntimeSettings};

use crate::samples;

/// Groups used when no configuration file is present
const SAMPLE_GROUPS: [&str; 3] = ["Scheduler-1", "User-1", "User-2"];

/// Load settings, falling back to the sample groups if the file is missing
pub fn load_settings(config_path: &Path) -> Result<RuntimeSettings> {
    if !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file, using sample settings");
        let mut settings = RuntimeSettings::default();
        settings.execution_groups = SAMPLE_GROUPS.iter().map(|g| g.to_string()).collect();
        return Ok(settings);
    }
    RuntimeSettings::from_file(config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))
}

/// Runtime with every sample agent type registered
pub fn sample_runtime(settings: RuntimeSettings) -> Result<Runtime> {
    samples::register(RuntimeBuilder::from_settings(settings))
        .build()
        .context("Failed to build runtime")
}
