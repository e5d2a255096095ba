//! Ports command - list the ports forwarded by running sessions.

use anyhow::Result;
use devforward_core::{state, ForwardingConfig, Platform, StateStore};

use super::truncate;

pub async fn run(config: &ForwardingConfig, platform: Option<Platform>, json: bool) -> Result<()> {
    let ports =
        state::get_forwarded_ports(&config.state_dir, platform, std::process::id()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        println!("No forwarded ports found.");
        return report_orphans(config).await;
    }

    println!(
        "{:<9} {:<20} {:<20} {:<22} {:<10}",
        "PLATFORM", "CONTAINER", "ENDPOINT", "LOCAL", "CONTAINER PORT"
    );
    println!("{}", "-".repeat(86));

    for port in &ports {
        let mut name = truncate(&port.port_name, 20);
        if port.is_debug {
            name = truncate(&format!("{name} (debug)"), 20);
        }
        println!(
            "{:<9} {:<20} {:<20} {:<22} {:<10}",
            port.platform,
            truncate(&port.container_name, 20),
            name,
            format!("{}:{}", port.local_address, port.local_port),
            port.container_port
        );
    }

    println!("\nTotal: {} ports", ports.len());
    report_orphans(config).await
}

/// Mentions state files left behind by sessions that did not exit cleanly.
async fn report_orphans(config: &ForwardingConfig) -> Result<()> {
    let store = StateStore::for_current_process(&config.state_dir, Platform::default());
    let orphans = store.orphan_files().await?;
    if !orphans.is_empty() {
        println!("\n{} state file(s) of ended sessions:", orphans.len());
        for path in &orphans {
            println!("  {}", path.display());
        }
    }
    Ok(())
}
