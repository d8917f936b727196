use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_model() -> String {
    "claude-sonnet-4.5".to_string()
}

fn default_markers() -> Vec<String> {
    ["🟢", "🔵", "🟣", "🟠", "🟡", "🔴", "🟤", "⚪"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_teardown_timeout_ms() -> u64 {
    3_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

/// Stored configuration (~/.tether/config.json).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TetherConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Working directory patterns offered to chats, e.g. `~/src/*`.
    #[serde(default)]
    pub directories: Vec<String>,
    /// argv of the JSON-lines assistant process.
    #[serde(default)]
    pub assistant_command: Vec<String>,
    /// Pool of per-session display markers.
    #[serde(default = "default_markers")]
    pub markers: Vec<String>,
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            directories: Vec::new(),
            assistant_command: Vec::new(),
            markers: default_markers(),
            teardown_timeout_ms: default_teardown_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl TetherConfig {
    pub fn data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tether")
    }

    pub fn config_path() -> PathBuf {
        Self::data_dir().join("config.json")
    }

    /// Load from ~/.tether/config.json. Missing file means defaults; a file
    /// that fails to parse is an error.
    pub fn load() -> Result<Self, std::io::Error> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &std::path::Path) -> Result<Self, std::io::Error> {
        match std::fs::read_to_string(path) {
            Ok(data) => serde_json::from_str(&data).map_err(std::io::Error::other),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e),
        }
    }

    pub fn save_to(&self, path: &std::path::Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, data)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            default_model: self.default_model.clone(),
            markers: self.markers.clone(),
            teardown_timeout: Duration::from_millis(self.teardown_timeout_ms),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
        }
    }
}

/// Runtime settings for an [`crate::Orchestrator`].
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub default_model: String,
    pub markers: Vec<String>,
    /// Upper bound for each session destroy / client stop call.
    pub teardown_timeout: Duration,
    /// Upper bound for tearing down every session at shutdown.
    pub shutdown_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        TetherConfig::default().orchestrator_config()
    }
}
