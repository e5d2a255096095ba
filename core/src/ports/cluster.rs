//! Cluster client port (interface).

use std::io::Write;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::domain::PortPair;
use crate::error::Result;

/// Pod hosting a running component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl PodRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
        }
    }
}

/// Notification raised by the transport while a tunnel is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    /// The streaming connection to the pod dropped; the tunnel must be reopened.
    LostConnection(String),
}

/// Port for the orchestration cluster.
///
/// Implementations resolve the pod of a component and open the multiplexed
/// streaming tunnel used by the cluster backend.
pub trait ClusterClient: Send + Sync + 'static {
    /// Find the pod running the given component.
    fn get_pod_for_component(
        &self,
        component: &str,
    ) -> impl std::future::Future<Output = Result<PodRef>> + Send;

    /// Forward every pair over a single tunnel to `pod`.
    ///
    /// Transport stdout is written to `out`, one confirmation line per pair.
    /// Resolves when the tunnel ends: `Ok(())` after `stop` fires, `Err` when
    /// the transport fails. Lost connections are reported on `events` and the
    /// tunnel keeps running until stopped.
    fn port_forward(
        &self,
        pod: &PodRef,
        pairs: &[PortPair],
        out: Box<dyn Write + Send>,
        stop: oneshot::Receiver<()>,
        events: mpsc::UnboundedSender<TunnelEvent>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
