//! Settings file.
//!
//! Settings are read from an optional YAML file. Every field has a default,
//! so an empty file (or no file) is valid:
//!
//! ```yaml
//! registry:
//!   root: /data/availai-registry
//!   api_key_env: WANDB_API_KEY
//! roboflow:
//!   api_url: https://api.roboflow.com
//!   timeout_secs: 60
//! ```

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AvailaiError;
use crate::hosting::{DEFAULT_ROBOFLOW_API_URL, DEFAULT_ROBOFLOW_TIMEOUT};
use crate::registry::offline::DEFAULT_API_KEY_ENV;

/// Registry root used when neither the settings file nor the CLI gives one.
pub const DEFAULT_REGISTRY_ROOT: &str = "availai-registry";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub registry: RegistrySettings,
    pub roboflow: RoboflowSettings,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistrySettings {
    pub root: Option<PathBuf>,
    /// Environment variable holding the ambient API key. An empty string
    /// disables the ambient fallback.
    pub api_key_env: String,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            root: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoboflowSettings {
    pub api_url: String,
    pub timeout_secs: u64,
}

impl Default for RoboflowSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_ROBOFLOW_API_URL.to_string(),
            timeout_secs: DEFAULT_ROBOFLOW_TIMEOUT.as_secs(),
        }
    }
}

impl Settings {
    /// Reads settings from a YAML file.
    pub fn load(path: &Path) -> Result<Self, AvailaiError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text).map_err(|source| AvailaiError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parses settings from YAML text. Blank text yields the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }

    /// Loads `path` if given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, AvailaiError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn registry_root(&self) -> PathBuf {
        self.registry
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_ROOT))
    }

    /// The ambient API key variable, or `None` when disabled.
    pub fn api_key_env(&self) -> Option<String> {
        let name = self.registry.api_key_env.trim();
        (!name.is_empty()).then(|| name.to_string())
    }
}
