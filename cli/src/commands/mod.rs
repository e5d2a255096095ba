//! Subcommand implementations.

pub mod check;
pub mod config;
pub mod forward;
pub mod ports;
pub mod scan;

use std::path::Path;

use anyhow::{bail, Result};
use devforward_core::{ConfigStore, ForwardingConfig, KubectlClient};

/// Loads the configuration from `path`, or from the default location.
pub async fn load_config(path: Option<&Path>) -> Result<ForwardingConfig> {
    Ok(config_store(path)?.load().await?)
}

/// Opens the store of the configuration file at `path`, or at the default location.
pub fn config_store(path: Option<&Path>) -> Result<ConfigStore> {
    Ok(match path {
        Some(path) => ConfigStore::with_path(path.to_path_buf()),
        None => ConfigStore::new()?,
    })
}

/// kubectl client of `config`, failing early when no kubectl is installed.
pub fn kubectl(config: &ForwardingConfig) -> Result<KubectlClient> {
    let client = KubectlClient::from_config(config);
    if !client.is_available() {
        bail!("kubectl not found; install it or set kubectlPath in the configuration");
    }
    Ok(client)
}

/// Truncates `s` to `max` characters.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{head}…")
    }
}
