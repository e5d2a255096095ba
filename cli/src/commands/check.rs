//! Check command - wait for container ports to listen.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use devforward_core::{ConnectionScanner, ForwardingConfig};

/// Groups `container:port` values by container.
fn ports_by_container(values: &[String]) -> Result<BTreeMap<String, Vec<u16>>> {
    let mut result: BTreeMap<String, Vec<u16>> = BTreeMap::new();
    for value in values {
        let Some((container, port)) = value.rsplit_once(':') else {
            bail!("invalid port {value:?}, expected containerName:port");
        };
        if container.is_empty() {
            bail!("invalid port {value:?}, container name is empty");
        }
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid port number in {value:?}"))?;
        result.entry(container.to_string()).or_default().push(port);
    }
    Ok(result)
}

pub async fn run(config: &ForwardingConfig, pod: &str, ports: &[String], timeout: u64) -> Result<()> {
    let ports = ports_by_container(ports)?;
    let scanner = ConnectionScanner::new(super::kubectl(config)?);

    scanner
        .check_ports_listening(pod, &ports, Duration::from_secs(timeout))
        .await?;
    println!("All ports are listening.");
    Ok(())
}
