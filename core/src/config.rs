//! Configuration management for forwarding sessions.
//!
//! Stores configuration in JSON format at `~/.devforward/config.json`.
//! Every field has a default, so a missing or partial file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::adapters::remote_process::DEFAULT_PID_DIR;
use crate::error::{Error, Result};
use crate::planner::{DEFAULT_BASE_PORT, DEFAULT_PORT_RANGE};
use crate::state::DEFAULT_STATE_DIR;

/// Tunables of the forwarding engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForwardingConfig {
    /// First local port tried by sequential planning.
    pub base_port: u16,

    /// Number of ports scanned above `base_port`.
    pub port_range: u16,

    /// Local address tunnels listen on.
    pub local_address: String,

    /// How long the first batch of confirmations may take.
    pub activation_timeout_secs: u64,

    /// First restart delay of the cluster tunnel.
    pub backoff_initial_millis: u64,

    /// Upper bound of the restart delay.
    pub backoff_max_secs: u64,

    /// How long a single relay may take to stop.
    pub relay_stop_timeout_secs: u64,

    /// Container hosting relays on the local runtime.
    pub helper_container: String,

    /// Relay executable inside the helper container.
    pub relay_binary: String,

    /// Working directory of relay processes.
    pub relay_working_dir: String,

    /// Directory holding remote PID files.
    pub pid_dir: String,

    /// Directory of session state files, relative to the working directory.
    pub state_dir: PathBuf,

    /// Explicit kubectl binary, searched in well-known locations otherwise.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubectl_path: Option<PathBuf>,

    /// Namespace passed to kubectl.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            base_port: DEFAULT_BASE_PORT,
            port_range: DEFAULT_PORT_RANGE,
            local_address: "127.0.0.1".to_string(),
            activation_timeout_secs: 60,
            backoff_initial_millis: 1000,
            backoff_max_secs: 60,
            relay_stop_timeout_secs: 30,
            helper_container: "odo-helper-port-forwarding".to_string(),
            relay_binary: "socat".to_string(),
            relay_working_dir: "/tmp".to_string(),
            pid_dir: DEFAULT_PID_DIR.to_string(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            kubectl_path: None,
            namespace: None,
        }
    }
}

impl ForwardingConfig {
    pub fn activation_timeout(&self) -> Duration {
        Duration::from_secs(self.activation_timeout_secs)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_millis)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_secs(self.backoff_max_secs)
    }

    pub fn relay_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_stop_timeout_secs)
    }
}

/// Configuration store.
///
/// Handles reading and writing configuration to `~/.devforward/config.json`.
pub struct ConfigStore {
    config_path: PathBuf,
}

impl ConfigStore {
    /// Create a new config store with the default path.
    pub fn new() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

        Ok(Self {
            config_path: home.join(".devforward").join("config.json"),
        })
    }

    /// Create a config store with a custom path.
    pub fn with_path(config_path: PathBuf) -> Self {
        Self { config_path }
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Load configuration from disk.
    ///
    /// Returns default config if the file doesn't exist.
    pub async fn load(&self) -> Result<ForwardingConfig> {
        if !self.config_path.exists() {
            return Ok(ForwardingConfig::default());
        }

        let content = fs::read_to_string(&self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to disk, creating the directory if needed.
    pub async fn save(&self, config: &ForwardingConfig) -> Result<()> {
        if let Some(dir) = self.config_path.parent() {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        let temp_path = self.config_path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to create temp config file: {}", e)))?;
        file.write_all(content.as_bytes())
            .await
            .map_err(|e| Error::Config(format!("Failed to write config: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Config(format!("Failed to sync config: {}", e)))?;

        fs::rename(&temp_path, &self.config_path)
            .await
            .map_err(|e| Error::Config(format!("Failed to rename config file: {}", e)))?;

        Ok(())
    }
}
