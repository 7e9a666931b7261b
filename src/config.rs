//! Engine Configuration
//!
//! Optional YAML file read by the command-line driver. Every field has a
//! default, so an empty file is a valid configuration:
//!
//! ```yaml
//! max_parallel: 8
//! storage_retries: 3
//! state_file: procflow-state.json
//! templates:
//!   - templates/onboarding.yaml
//!   - templates/billing.yaml
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::execution::manager::{ManagerConfig, DEFAULT_STORAGE_RETRIES};

/// Settings for building an [`Engine`](crate::Engine).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum handlers or processes running at once
    pub max_parallel: usize,

    /// Retries for transient storage failures
    pub storage_retries: u32,

    /// JSON snapshot file; processes are kept in memory when unset
    pub state_file: Option<PathBuf>,

    /// Template files to load
    pub templates: Vec<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel: num_cpus::get(),
            storage_retries: DEFAULT_STORAGE_RETRIES,
            state_file: None,
            templates: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Loads a configuration file. Relative template and state paths are
    /// resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&content).map_err(|source| ConfigurationError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        };

        if let Some(base) = path.parent() {
            config.templates = config.templates.iter().map(|t| base.join(t)).collect();
            config.state_file = config.state_file.map(|s| base.join(s));
        }
        config.max_parallel = config.max_parallel.max(1);

        info!(
            "Loaded configuration from {} ({} templates)",
            path.display(),
            config.templates.len()
        );
        Ok(config)
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            max_parallel: self.max_parallel.max(1),
            storage_retries: self.storage_retries,
        }
    }
}
