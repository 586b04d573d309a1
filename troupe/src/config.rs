//! Runtime configuration parsing.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::error::StorageError;
use crate::placement::ExecutionGroup;
use crate::state::{FileStorage, MemoryStorage, StateStorage};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Failed to open storage: {0}")]
    StorageError(#[from] StorageError),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Runtime settings matching the troupe.yml schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Names of the execution groups activations can be placed on
    #[serde(default)]
    pub execution_groups: Vec<String>,

    /// Bound on calls into an agent, in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Idle period before an activation is evicted, in milliseconds; 0 disables
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    #[serde(default)]
    pub storage: StorageSettings,

    /// Correlation ids remembered per activation for duplicate detection
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,

    /// Buffered state-change notifications per watcher
    #[serde(default = "default_change_feed_capacity")]
    pub change_feed_capacity: usize,

    // Internal: path to config file (for relative path resolution)
    #[serde(skip)]
    config_path: Option<PathBuf>,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_dedup_capacity() -> usize {
    4096
}

fn default_change_feed_capacity() -> usize {
    1024
}

/// Where agent records are kept
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageSettings {
    #[default]
    Memory,
    File {
        path: PathBuf,
    },
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            execution_groups: Vec::new(),
            call_timeout_ms: default_call_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            storage: StorageSettings::default(),
            dedup_capacity: default_dedup_capacity(),
            change_feed_capacity: default_change_feed_capacity(),
            config_path: None,
        }
    }
}

impl RuntimeSettings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let mut settings = Self::from_yaml(&contents)?;

        // Store config file path for relative path resolution
        settings.config_path = Some(path.to_path_buf());

        Ok(settings)
    }

    /// Parse settings from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let settings: RuntimeSettings = serde_yaml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "call_timeout_ms".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if let Some(blank) = self.execution_groups.iter().find(|g| g.trim().is_empty()) {
            return Err(ConfigError::InvalidValue {
                field: "execution_groups".into(),
                reason: format!("blank group name {blank:?}"),
            });
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// `None` when idle eviction is disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn groups(&self) -> Vec<ExecutionGroup> {
        self.execution_groups
            .iter()
            .map(|name| ExecutionGroup::new(name.trim()))
            .collect()
    }

    /// Open the configured storage backend
    pub fn open_storage(&self) -> Result<Arc<dyn StateStorage>, ConfigError> {
        let storage: Arc<dyn StateStorage> = match &self.storage {
            StorageSettings::Memory => Arc::new(MemoryStorage::new()),
            StorageSettings::File { path } => Arc::new(FileStorage::open(self.resolve_path(path))?),
        };
        Ok(storage)
    }

    /// Resolve a path relative to the config file location
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else if let Some(parent) = self.config_path.as_ref().and_then(|p| p.parent()) {
            parent.join(path)
        } else {
            path.to_path_buf()
        }
    }
}
