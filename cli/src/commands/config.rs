//! Config command - show the effective configuration.

use std::path::Path;

use anyhow::Result;
use devforward_core::{ForwardingConfig, KubectlClient};

use super::config_store;

pub async fn init(config: &ForwardingConfig, path: Option<&Path>) -> Result<()> {
    let store = config_store(path)?;
    store.save(config).await?;
    println!("Configuration written to {}", store.config_path().display());
    Ok(())
}

pub fn show(config: &ForwardingConfig, path: Option<&Path>, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(config)?);
        return Ok(());
    }

    let location = match path {
        Some(path) => path.display().to_string(),
        None => config_store(None)?.config_path().display().to_string(),
    };
    println!("Configuration ({location}):\n");
    println!("  Base port:            {}", config.base_port);
    println!("  Port range:           {}", config.port_range);
    println!("  Local address:        {}", config.local_address);
    println!("  Activation timeout:   {}s", config.activation_timeout_secs);
    println!(
        "  Restart backoff:      {}ms .. {}s",
        config.backoff_initial_millis, config.backoff_max_secs
    );
    println!("  Relay stop timeout:   {}s", config.relay_stop_timeout_secs);
    println!("  Helper container:     {}", config.helper_container);
    println!("  Relay binary:         {}", config.relay_binary);
    println!("  Relay working dir:    {}", config.relay_working_dir);
    println!("  PID directory:        {}", config.pid_dir);
    println!("  State directory:      {}", config.state_dir.display());
    println!(
        "  kubectl:              {}",
        KubectlClient::from_config(config)
            .kubectl_path()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not found)".to_string())
    );
    println!(
        "  Namespace:            {}",
        config.namespace.as_deref().unwrap_or("(current context)")
    );
    Ok(())
}
