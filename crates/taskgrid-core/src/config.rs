//! taskgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::Settings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    /// Seeds the settings record on first start only.
    pub defaults: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
    /// Externally reachable base URL used to build task callback URLs.
    pub callback_base_url: String,
    pub node_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8650,
            data_dir: PathBuf::from("/var/lib/taskgrid"),
            callback_base_url: "http://127.0.0.1:8650".to_string(),
            node_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seconds between heartbeat / cancel-timeout sweeps.
    pub sweep_interval_secs: u64,
    pub cas_max_attempts: u32,
    /// Attempts per outbound call before it counts as a network failure.
    pub remote_attempts: u32,
    pub remote_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 5,
            cas_max_attempts: 16,
            remote_attempts: 3,
            remote_timeout_ms: 5_000,
        }
    }
}

impl GridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: GridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
