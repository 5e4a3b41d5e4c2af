use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use balance_watch_source_rpc::{DEFAULT_RPC_URL, DEFAULT_TIMEOUT_MS};
use serde::{Deserialize, Serialize};

pub const DEFAULT_STORE_PATH: &str = "balance_snapshots.csv";
pub const DEFAULT_EPOCH_INTERVAL_HOURS: u32 = 48;

/// Placeholder in `store_path` replaced by the watched address.
pub const ADDRESS_PLACEHOLDER: &str = "{address}";

/// Settings shared by every command. Loaded once and passed down explicitly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    pub rpc_url: String,
    pub store_path: String,
    pub timeout_ms: u64,
    pub epoch_interval_hours: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.to_string(),
            store_path: DEFAULT_STORE_PATH.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            epoch_interval_hours: DEFAULT_EPOCH_INTERVAL_HOURS,
        }
    }
}

impl WatchConfig {
    /// Reads a YAML config file. Missing keys fall back to defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error on malformed YAML, unknown keys, or invalid values.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Self =
            serde_yaml::from_str(yaml).map_err(|err| anyhow!("invalid config YAML: {err}"))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.trim().is_empty() {
            return Err(anyhow!("rpc_url must not be empty"));
        }
        if self.store_path.trim().is_empty() {
            return Err(anyhow!("store_path must not be empty"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than zero"));
        }
        if self.epoch_interval_hours == 0 {
            return Err(anyhow!("epoch_interval_hours must be greater than zero"));
        }
        Ok(())
    }

    /// Resolves the log file for `address`, expanding [`ADDRESS_PLACEHOLDER`].
    ///
    /// # Errors
    /// Returns an error when the address would escape the configured directory.
    pub fn store_path_for(&self, address: &str) -> Result<PathBuf> {
        if !self.store_path.contains(ADDRESS_PLACEHOLDER) {
            return Ok(PathBuf::from(&self.store_path));
        }

        if address.contains(['/', '\\']) || address.contains("..") {
            return Err(anyhow!(
                "address '{address}' cannot be used in store_path template"
            ));
        }

        Ok(PathBuf::from(
            self.store_path.replace(ADDRESS_PLACEHOLDER, address),
        ))
    }
}
