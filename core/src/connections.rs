//! Connection scanner.
//!
//! Reads the kernel socket tables (`/proc/net/{tcp,udp,tcp6,udp6}`) of a
//! container through an [`ExecClient`] and decodes them into [`Connection`]
//! records. Addresses are printed by the kernel as hex words in host byte
//! order, so every 32-bit word is byte-reversed before display.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::backoff::ExpBackoff;
use crate::domain::{Connection, ForwardedPort, TcpState};
use crate::error::{Error, Result};
use crate::ports::ExecClient;

/// Shell used to run the socket table dump.
pub const SHELL_EXECUTABLE: &str = "/bin/sh";

/// Dumps all four socket tables. Missing tables are tolerated.
pub const SOCKET_TABLES_COMMAND: &str =
    "cat /proc/net/tcp /proc/net/udp /proc/net/tcp6 /proc/net/udp6 || true";

/// Base delay between two readiness polls.
const POLL_BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the readiness poll delay.
const POLL_BACKOFF_MAX: Duration = Duration::from_secs(10);

// ============================================================================
// Decoding
// ============================================================================

fn decode_hex_byte(pair: &str) -> Result<u8> {
    u8::from_str_radix(pair, 16).map_err(|e| Error::Parse(format!("invalid hex byte {pair:?}: {e}")))
}

/// Decodes an 8-digit byte-reversed IPv4 address, e.g. `0100007F` to `127.0.0.1`.
pub fn decode_ipv4(hex: &str) -> Result<String> {
    if hex.len() != 8 || !hex.is_ascii() {
        return Err(Error::Parse(format!("invalid IPv4 hex address {hex:?}")));
    }
    let octets = (0..4)
        .rev()
        .map(|i| decode_hex_byte(&hex[i * 2..i * 2 + 2]).map(|b| b.to_string()))
        .collect::<Result<Vec<_>>>()?;
    Ok(octets.join("."))
}

/// Decodes a 32-digit IPv6 address made of four byte-reversed words.
///
/// Groups keep the case of the input, e.g. `0000000000000000FFFF00000100007F`
/// becomes `0000:0000:0000:0000:0000:FFFF:7F00:0001`.
pub fn decode_ipv6(hex: &str) -> Result<String> {
    if hex.len() != 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Parse(format!("invalid IPv6 hex address {hex:?}")));
    }
    let mut groups = Vec::with_capacity(8);
    for word in 0..4 {
        let w = &hex[word * 8..word * 8 + 8];
        let reversed = format!("{}{}{}{}", &w[6..8], &w[4..6], &w[2..4], &w[0..2]);
        groups.push(reversed[0..4].to_string());
        groups.push(reversed[4..8].to_string());
    }
    Ok(groups.join(":"))
}

fn decode_endpoint(field: &str) -> Result<(String, u16)> {
    let mut parts = field.split(':');
    let (addr_hex, port_hex) = match (parts.next(), parts.next(), parts.next()) {
        (Some(addr), Some(port), None) => (addr, port),
        _ => {
            return Err(Error::Parse(format!(
                "invalid format, must be <addr>:<port> but was {field:?}"
            )))
        }
    };

    let addr = match addr_hex.len() {
        8 => decode_ipv4(addr_hex)?,
        32 => decode_ipv6(addr_hex)?,
        n => {
            return Err(Error::Parse(format!(
                "address length must be 8 (IPv4) or 32 (IPv6), but was {n}"
            )))
        }
    };
    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|e| Error::Parse(format!("invalid port in {field:?}: {e}")))?;
    Ok((addr, port))
}

/// Decodes socket table lines, keeping those whose state passes `predicate`.
///
/// Header lines, truncated lines and lines with undecodable fields are skipped.
pub fn parse_connections<I, S, F>(lines: I, predicate: F) -> Vec<Connection>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
    F: Fn(Option<TcpState>) -> bool,
{
    let mut connections = Vec::new();
    for line in lines {
        let line = line.as_ref();
        if line.contains("local_address") {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().take(4).collect();
        if fields.len() < 4 {
            trace!(line, "ignoring line with fewer than 4 fields");
            continue;
        }

        let code = match u32::from_str_radix(fields[3], 16) {
            Ok(code) => code,
            Err(e) => {
                debug!(line, error = %e, "could not decode connection state");
                continue;
            }
        };
        let state = TcpState::from_code(code);
        if !predicate(state) {
            continue;
        }

        let (local_address, local_port) = match decode_endpoint(fields[1]) {
            Ok(v) => v,
            Err(e) => {
                debug!(line, error = %e, "could not decode local address");
                continue;
            }
        };
        let (remote_address, remote_port) = match decode_endpoint(fields[2]) {
            Ok(v) => v,
            Err(e) => {
                debug!(line, error = %e, "could not decode remote address");
                continue;
            }
        };

        connections.push(Connection {
            local_address,
            local_port,
            remote_address,
            remote_port,
            state,
        });
    }
    connections
}

/// Whether a decoded address is a loopback address, IPv4-mapped ones included.
pub fn is_loopback_address(address: &str) -> bool {
    match address.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback(),
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback() || ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback())
        }
        Err(_) => false,
    }
}

/// Keeps the ports served by a loopback-bound listening connection.
pub fn filter_bound_on_loopback(
    listening: &[Connection],
    ports: &[ForwardedPort],
) -> Vec<ForwardedPort> {
    ports
        .iter()
        .filter(|p| {
            listening.iter().any(|c| {
                c.local_port == p.container_port && is_loopback_address(&c.local_address)
            })
        })
        .cloned()
        .collect()
}

// ============================================================================
// Scanner
// ============================================================================

/// Scans container socket tables.
pub struct ConnectionScanner<E: ExecClient> {
    exec: Arc<E>,
}

impl<E: ExecClient> Clone for ConnectionScanner<E> {
    fn clone(&self) -> Self {
        Self {
            exec: Arc::clone(&self.exec),
        }
    }
}

impl<E: ExecClient> ConnectionScanner<E> {
    pub fn new(exec: E) -> Self {
        Self {
            exec: Arc::new(exec),
        }
    }

    pub fn from_arc(exec: Arc<E>) -> Self {
        Self { exec }
    }

    async fn dump(&self, pod: &str, container: &str) -> Result<Vec<String>> {
        let command = [SHELL_EXECUTABLE.to_string(), "-c".to_string(), SOCKET_TABLES_COMMAND.to_string()];
        self.exec.execute_command(pod, container, &command).await
    }

    /// All connections of `container`.
    pub async fn get_connections(&self, pod: &str, container: &str) -> Result<Vec<Connection>> {
        let lines = self.dump(pod, container).await?;
        Ok(parse_connections(lines, |_| true))
    }

    /// Connections of `container` in `LISTEN` state.
    pub async fn get_listening_connections(
        &self,
        pod: &str,
        container: &str,
    ) -> Result<Vec<Connection>> {
        let lines = self.dump(pod, container).await?;
        Ok(parse_connections(lines, |state| state == Some(TcpState::Listen)))
    }

    /// Returns the subset of `ports` whose container port listens on loopback only.
    pub async fn detect_ports_bound_on_loopback(
        &self,
        pod: &str,
        container: &str,
        ports: &[ForwardedPort],
    ) -> Result<Vec<ForwardedPort>> {
        if ports.is_empty() {
            return Ok(Vec::new());
        }
        let listening = self.get_listening_connections(pod, container).await?;
        Ok(filter_bound_on_loopback(&listening, ports))
    }

    /// Polls every container until all its ports listen or `timeout` elapses.
    ///
    /// Containers are polled concurrently with an exponential delay between
    /// polls. The error lists the ports still missing per container.
    pub async fn check_ports_listening(
        &self,
        pod: &str,
        ports_by_container: &BTreeMap<String, Vec<u16>>,
        timeout: Duration,
    ) -> Result<()> {
        if ports_by_container.is_empty() {
            return Ok(());
        }
        if timeout <= POLL_BACKOFF_BASE {
            return Err(Error::InvalidTimeout {
                timeout,
                min: POLL_BACKOFF_BASE,
            });
        }

        let deadline = Instant::now() + timeout;
        let mut tasks = JoinSet::new();
        for (container, ports) in ports_by_container {
            if ports.is_empty() {
                continue;
            }
            let scanner = self.clone();
            let pod = pod.to_string();
            let container = container.clone();
            let ports = ports.clone();
            tasks.spawn(async move {
                let missing = scanner.wait_listening(&pod, &container, &ports, deadline).await;
                (container, missing)
            });
        }

        let mut not_listening: BTreeMap<String, Vec<u16>> = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, missing)) if missing.is_empty() => {}
                Ok((container, missing)) => {
                    not_listening.insert(container, missing);
                }
                Err(e) => return Err(Error::CommandFailed(format!("port check task failed: {e}"))),
            }
        }

        if not_listening.is_empty() {
            return Ok(());
        }
        debug!(?not_listening, "ports not listening");
        let detail = not_listening
            .iter()
            .map(|(container, ports)| {
                let list: Vec<String> = ports.iter().map(u16::to_string).collect();
                format!("{} in container {:?}", list.join(", "), container)
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(Error::PortsNotListening(detail))
    }

    /// Returns the ports still not listening when the deadline hit.
    async fn wait_listening(
        &self,
        pod: &str,
        container: &str,
        ports: &[u16],
        deadline: Instant,
    ) -> Vec<u16> {
        let mut backoff = ExpBackoff::new(POLL_BACKOFF_BASE, POLL_BACKOFF_MAX);
        loop {
            let missing: BTreeSet<u16> =
                match timeout_at(deadline, self.get_listening_connections(pod, container)).await {
                    Ok(Ok(connections)) => ports
                        .iter()
                        .copied()
                        .filter(|p| !connections.iter().any(|c| c.local_port == *p))
                        .collect(),
                    Ok(Err(e)) => {
                        debug!(container, error = %e, "error getting listening connections");
                        ports.iter().copied().collect()
                    }
                    Err(_) => ports.iter().copied().collect(),
                };

            if missing.is_empty() {
                return Vec::new();
            }
            let now = Instant::now();
            if now >= deadline {
                return missing.into_iter().collect();
            }
            debug!(container, ?missing, "ports not listening yet");
            let delay = backoff.delay().min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }
}
