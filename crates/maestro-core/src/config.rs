//! Library configuration: permit capacities, retry backoff, fallback policy.
//!
//! Loaded from YAML:
//!
//! ```yaml
//! limits:
//!   "backend:gemini": 2
//!   "backend:openrouter": 4
//! defaultLimit: 4
//! retryBackoffMs: 500
//! fallback:
//!   enabled: true
//!   candidates:
//!     gemini:
//!       - gemini-2.0-flash
//!       - gemini-1.5-pro
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Permit capacity per resource key.
    pub limits: HashMap<String, usize>,
    /// Capacity for resource keys not listed in `limits`.
    pub default_limit: usize,
    /// Base delay for the exponential retry backoff.
    pub retry_backoff_ms: u64,
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Ordered fallback candidates per backend, most capable first.
    /// Backends missing here keep the built-in lists.
    pub candidates: HashMap<String, Vec<String>>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            limits: HashMap::new(),
            default_limit: 4,
            retry_backoff_ms: 500,
            fallback: FallbackConfig::default(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            candidates: HashMap::new(),
        }
    }
}

impl CoreConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Config(format!("failed to parse config YAML: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CoreError::Config(format!("failed to read config file '{}': {e}", path.display()))
        })?;
        Self::from_yaml(&content)
    }

    /// Default location: `<user config dir>/maestro/config.yaml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("maestro").join("config.yaml"))
    }

    /// Permit capacity for a resource key.
    pub fn limit_for(&self, resource: &str) -> usize {
        self.limits.get(resource).copied().unwrap_or(self.default_limit)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}
