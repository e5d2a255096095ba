//! Scan command - show the socket tables of a container.

use anyhow::Result;
use devforward_core::{ConnectionScanner, ForwardedPort, ForwardingConfig};
use serde::Serialize;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoopbackReport<'a> {
    pod: &'a str,
    container: &'a str,
    loopback_ports: Vec<u16>,
}

pub async fn run(
    config: &ForwardingConfig,
    pod: &str,
    container: &str,
    listening: bool,
    loopback: &[u16],
    json: bool,
) -> Result<()> {
    let scanner = ConnectionScanner::new(super::kubectl(config)?);

    if !loopback.is_empty() {
        let candidates: Vec<ForwardedPort> = loopback
            .iter()
            .map(|port| ForwardedPort {
                container_name: container.to_string(),
                container_port: *port,
                ..Default::default()
            })
            .collect();
        let bound: Vec<u16> = scanner
            .detect_ports_bound_on_loopback(pod, container, &candidates)
            .await?
            .iter()
            .map(|p| p.container_port)
            .collect();

        if json {
            let report = LoopbackReport {
                pod,
                container,
                loopback_ports: bound,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else if bound.is_empty() {
            println!("None of the ports listens on loopback in {container}.");
        } else {
            for port in &bound {
                println!("{port} listens on loopback only; it is not reachable from outside {container}");
            }
        }
        return Ok(());
    }

    let connections = if listening {
        scanner.get_listening_connections(pod, container).await?
    } else {
        scanner.get_connections(pod, container).await?
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&connections)?);
        return Ok(());
    }

    if connections.is_empty() {
        println!("No connections found.");
        return Ok(());
    }

    println!("{:<12} {:<45} REMOTE", "STATE", "LOCAL");
    println!("{}", "-".repeat(100));
    for c in &connections {
        println!(
            "{:<12} {:<45} {}:{}",
            c.state_name(),
            format!("{}:{}", c.local_address, c.local_port),
            c.remote_address,
            c.remote_port
        );
    }
    println!("\nTotal: {} connections", connections.len());
    Ok(())
}
