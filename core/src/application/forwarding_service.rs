//! Port forwarding application service.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::domain::{container_endpoint_map, ContainerComponent, ContainerEndpointMap, ForwardedPort, Platform};
use crate::error::Result;
use crate::forwarder::TunnelBackend;
use crate::planner::{plan_mode, LocalPortProbe, PlanMode, PortPlanner, PortProbe};
use crate::state::StateStore;

/// Options of a start request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Forward debug endpoints too.
    pub debug: bool,
    /// Let the OS pick every local port.
    pub random_ports: bool,
    /// User-supplied `local:[container:]remote` definitions.
    pub defined_ports: Vec<ForwardedPort>,
}

/// What a start request did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The component, endpoints and options match the running session;
    /// nothing was touched.
    Unchanged,
    /// The component declares no endpoint to forward; any previous session was stopped.
    NoEndpoints,
    /// Tunnels were (re)opened.
    Started,
}

/// What the running session was started from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Applied {
    component: String,
    mapping: ContainerEndpointMap,
    mode: PlanMode,
}

/// Application service for port forwarding sessions.
///
/// Composes the planner, one tunnel backend and the state store behind a
/// start/stop/query contract. Tunnels are only rebuilt when the component,
/// its endpoints or the planning options change.
pub struct ForwardingService<B: TunnelBackend, P: PortProbe = LocalPortProbe> {
    backend: B,
    planner: PortPlanner<P>,
    store: Arc<StateStore>,
    applied: Mutex<Option<Applied>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl<B: TunnelBackend> ForwardingService<B, LocalPortProbe> {
    /// Create a service planning ports from `base_port` upward.
    pub fn new(backend: B, store: Arc<StateStore>, base_port: u16, port_range: u16) -> Self {
        Self::with_planner(backend, store, PortPlanner::new(base_port, port_range))
    }
}

impl<B: TunnelBackend, P: PortProbe> ForwardingService<B, P> {
    pub fn with_planner(backend: B, store: Arc<StateStore>, planner: PortPlanner<P>) -> Self {
        Self {
            backend,
            planner,
            store,
            applied: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn platform(&self) -> Platform {
        self.backend.platform()
    }

    /// Record the session identity with no forwarded port.
    pub async fn init(&self) -> Result<()> {
        self.store.init().await
    }

    /// Forward the endpoints of `containers`.
    pub async fn start_port_forwarding(
        &self,
        component: &str,
        containers: &[ContainerComponent],
        options: StartOptions,
    ) -> Result<StartOutcome> {
        let _op = self.op_lock.lock().await;
        let mode = plan_mode(options.random_ports, options.defined_ports)?;
        let mapping = container_endpoint_map(containers, options.debug);

        let requested = Applied {
            component: component.to_string(),
            mapping,
            mode,
        };
        if self.applied.lock().as_ref() == Some(&requested) {
            debug!(component, "endpoints unchanged, keeping current tunnels");
            return Ok(StartOutcome::Unchanged);
        }

        *self.applied.lock() = None;
        self.backend.stop().await?;

        if requested.mapping.is_empty() {
            info!(component, "no endpoint to forward");
            *self.applied.lock() = Some(requested);
            return Ok(StartOutcome::NoEndpoints);
        }

        let plan = self.planner.plan(&requested.mapping, &requested.mode)?;
        self.backend.start(component, &requested.mapping, &plan).await?;
        info!(
            component,
            platform = %self.backend.platform(),
            ports = self.backend.forwarded_ports().len(),
            "port forwarding started"
        );
        *self.applied.lock() = Some(requested);
        Ok(StartOutcome::Started)
    }

    /// Tear down every tunnel of the session and clear its saved ports.
    pub async fn stop_port_forwarding(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        *self.applied.lock() = None;
        self.backend.stop().await
    }

    /// Ports forwarded by this session.
    pub fn get_forwarded_ports(&self) -> Vec<ForwardedPort> {
        self.backend.forwarded_ports()
    }

    /// Ports recorded by every live session, on `platform` or on all platforms.
    pub async fn get_all_forwarded_ports(
        &self,
        platform: Option<Platform>,
    ) -> Result<Vec<ForwardedPort>> {
        self.store.get_forwarded_ports(platform).await
    }

    /// Endpoints of the running session.
    pub fn applied_endpoints(&self) -> Option<ContainerEndpointMap> {
        self.applied.lock().as_ref().map(|a| a.mapping.clone())
    }

    /// Observe failures to save the ports of the running session.
    pub fn persist_errors(&self) -> watch::Receiver<Option<String>> {
        self.backend.persist_errors()
    }

    /// Stop forwarding and record a clean exit.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.stop_port_forwarding().await;
        self.store.save_exit().await?;
        stopped
    }
}
