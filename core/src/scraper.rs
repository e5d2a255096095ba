//! Output protocol scraper.
//!
//! A cluster tunnel prints one confirmation line per forwarded pair:
//!
//! ```text
//! Forwarding from 127.0.0.1:20001 -> 3000
//! ```
//!
//! [`PortWriter`] sits between the tunnel's stdout and the user's terminal.
//! It decorates confirmation lines, turns them into [`ForwardedPort`]
//! records and reports the batch once every expected pair has confirmed.

use std::io::{self, Write};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use regex::Regex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::domain::{find_endpoint, ContainerEndpointMap, ForwardedPort, Platform};
use crate::error::{Error, Result};

/// Prefix identifying a confirmation line.
pub const CONFIRMATION_PREFIX: &str = "Forwarding from ";

/// Prefix added to confirmation lines echoed to the user.
pub(crate) const ECHO_PREFIX: &str = " -  ";

/// Output shared by every writer of a session.
pub type SharedOutput = Arc<Mutex<Box<dyn Write + Send>>>;

/// Wraps the process stdout as a [`SharedOutput`].
pub fn stdout_output() -> SharedOutput {
    Arc::new(Mutex::new(Box::new(io::stdout())))
}

fn confirmation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Forwarding from (\S+):(\d+) -> (\d+)$").expect("valid regex")
    })
}

/// Parses one confirmation line into a forwarded port.
///
/// Container and port names come from the first endpoint of `mapping` whose
/// target port matches. Ties go to the lexicographically smallest container.
pub fn parse_forwarding_line(line: &str, mapping: &ContainerEndpointMap) -> Result<ForwardedPort> {
    let caps = confirmation_regex()
        .captures(line.trim_end())
        .ok_or_else(|| Error::Parse(format!("unexpected confirmation line {line:?}")))?;

    let local_port: u16 = caps[2]
        .parse()
        .map_err(|e| Error::Parse(format!("invalid local port in {line:?}: {e}")))?;
    let container_port: u16 = caps[3]
        .parse()
        .map_err(|e| Error::Parse(format!("invalid container port in {line:?}: {e}")))?;

    let mut port = ForwardedPort {
        platform: Platform::Cluster,
        local_address: caps[1].to_string(),
        local_port,
        container_port,
        ..Default::default()
    };
    if let Some((container, endpoint)) = find_endpoint(mapping, container_port) {
        port = ForwardedPort::for_endpoint(
            Platform::Cluster,
            container,
            endpoint,
            port.local_address,
            local_port,
        );
    }
    Ok(port)
}

/// Writer receiving a tunnel's stdout.
///
/// Partial lines are buffered until their newline arrives. Lines without the
/// confirmation prefix are copied to the output untouched and do not count
/// toward the batch.
pub struct PortWriter {
    mapping: ContainerEndpointMap,
    output: SharedOutput,
    pending: Vec<u8>,
    remaining: usize,
    ports: Vec<ForwardedPort>,
    complete: Option<oneshot::Sender<Vec<ForwardedPort>>>,
}

impl PortWriter {
    /// Creates a writer expecting `expected` confirmations.
    ///
    /// The returned receiver yields the batch once all of them arrived.
    pub fn new(
        output: SharedOutput,
        expected: usize,
        mapping: ContainerEndpointMap,
    ) -> (Self, oneshot::Receiver<Vec<ForwardedPort>>) {
        let (tx, rx) = oneshot::channel();
        let mut writer = Self {
            mapping,
            output,
            pending: Vec::new(),
            remaining: expected,
            ports: Vec::with_capacity(expected),
            complete: Some(tx),
        };
        writer.maybe_complete();
        (writer, rx)
    }

    fn handle_line(&mut self, line: &str) -> io::Result<()> {
        if !line.starts_with(CONFIRMATION_PREFIX) {
            let mut out = self.output.lock();
            return writeln!(out, "{line}");
        }

        writeln!(self.output.lock(), "{ECHO_PREFIX}{line}")?;

        match parse_forwarding_line(line, &self.mapping) {
            Ok(port) => {
                debug!(
                    local_port = port.local_port,
                    container_port = port.container_port,
                    container = %port.container_name,
                    "port forwarded"
                );
                if self.complete.is_some() {
                    self.ports.push(port);
                }
            }
            Err(e) => warn!(error = %e, "ignoring malformed confirmation line"),
        }

        self.remaining = self.remaining.saturating_sub(1);
        self.maybe_complete();
        Ok(())
    }

    fn maybe_complete(&mut self) {
        if self.remaining > 0 {
            return;
        }
        if let Some(tx) = self.complete.take() {
            // The receiver may be gone when the session is already stopping.
            let _ = tx.send(std::mem::take(&mut self.ports));
        }
    }
}

impl Write for PortWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.handle_line(line.trim_end_matches(['\n', '\r']))?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.pending.is_empty() {
            let raw = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.handle_line(line.trim_end_matches('\r'))?;
        }
        self.output.lock().flush()
    }
}
