//! Tunnel backends.
//!
//! Two transports open the tunnels of a session:
//! - [`KubePortForwarder`]: one multiplexed cluster tunnel carrying every pair,
//!   supervised by a restart loop
//! - [`ExecPortForwarder`]: one relay process per port inside a helper container
//!
//! Both implement [`TunnelBackend`], which the forwarding service drives.

mod cluster;
mod exec;

use std::fmt;

use tokio::sync::watch;

use crate::domain::{ContainerEndpointMap, ForwardedPort, Platform};
use crate::error::Result;
use crate::planner::PortPlan;

pub use cluster::KubePortForwarder;
pub use exec::{relay_command_line, relay_id, ExecPortForwarder, RelaySettings};

/// Lifecycle of a cluster tunnel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TunnelState {
    #[default]
    Idle,
    Starting,
    Running,
    Restarting,
    Stopping,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport able to forward a planned set of ports.
pub trait TunnelBackend: Send + Sync {
    /// Platform recorded on the forwarded ports.
    fn platform(&self) -> Platform;

    /// Open tunnels for every pair of `plan`.
    ///
    /// Returns once the tunnels are established. Any previous session of this
    /// backend is stopped first.
    fn start(
        &self,
        component: &str,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Tear down every tunnel and clear the ports recorded for the session.
    ///
    /// Fails when the state store cannot be updated; the tunnels are closed
    /// regardless.
    fn stop(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Whether a session is currently open.
    fn is_running(&self) -> bool;

    /// Ports currently forwarded.
    fn forwarded_ports(&self) -> Vec<ForwardedPort>;

    /// Observe failures to save the ports of a running session.
    ///
    /// Holds the last error, or `None` once a later save succeeded. Failures
    /// while starting are returned by [`TunnelBackend::start`] instead.
    fn persist_errors(&self) -> watch::Receiver<Option<String>>;
}
