//! Exec tunnel backend.
//!
//! Every forwarded port is served by its own relay process running in a
//! helper container of the pod. Relays report status transitions to a single
//! coordinator task, the only owner of the set of active ports.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace, warn};

use super::TunnelBackend;
use crate::config::ForwardingConfig;
use crate::domain::{ContainerEndpointMap, ForwardedPort, Platform, Protocol};
use crate::error::{Error, Result};
use crate::planner::{ephemeral_port, PortPlan};
use crate::ports::{CommandDefinition, ProcessEvent, RemoteProcessManager, RemoteProcessStatus};
use crate::scraper::{SharedOutput, ECHO_PREFIX};
use crate::state::StateStore;

/// Where and how relays run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub helper_container: String,
    pub relay_binary: String,
    pub working_dir: String,
    pub local_address: String,
    /// How long `start` waits for the first relay to run.
    pub activation_timeout: Duration,
    pub stop_timeout: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &ForwardingConfig) -> Self {
        Self {
            helper_container: config.helper_container.clone(),
            relay_binary: config.relay_binary.clone(),
            working_dir: config.relay_working_dir.clone(),
            local_address: config.local_address.clone(),
            activation_timeout: config.activation_timeout(),
            stop_timeout: config.relay_stop_timeout(),
        }
    }
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from_config(&ForwardingConfig::default())
    }
}

/// Identifier of the relay serving `port`.
pub fn relay_id(port: &ForwardedPort) -> String {
    format!("pf-{}-{}", port.container_name, port.port_name)
}

/// Command line of a relay listening on `local_port` and connecting to
/// `container_port` on the loopback interface of the pod.
pub fn relay_command_line(
    binary: &str,
    protocol: Protocol,
    local_port: u16,
    container_port: u16,
) -> String {
    format!("{binary} -d {protocol}-listen:{local_port},reuseaddr,fork {protocol}:localhost:{container_port}")
}

struct ExecSession {
    pod: String,
    component: String,
    plan: PortPlan,
    relay_ids: Vec<String>,
    shutdown_tx: oneshot::Sender<()>,
    coordinator: JoinHandle<Result<()>>,
}

/// Forwards ports through relay processes in a helper container.
pub struct ExecPortForwarder<P: RemoteProcessManager> {
    manager: Arc<P>,
    store: Arc<StateStore>,
    output: SharedOutput,
    settings: RelaySettings,
    active_tx: watch::Sender<Vec<ForwardedPort>>,
    persist_error_tx: watch::Sender<Option<String>>,
    session: Mutex<Option<ExecSession>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl<P: RemoteProcessManager> ExecPortForwarder<P> {
    pub fn new(
        manager: P,
        store: Arc<StateStore>,
        output: SharedOutput,
        settings: RelaySettings,
    ) -> Self {
        let (active_tx, _) = watch::channel(Vec::new());
        let (persist_error_tx, _) = watch::channel(None);
        Self {
            manager: Arc::new(manager),
            store,
            output,
            settings,
            active_tx,
            persist_error_tx,
            session: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Observe the set of active ports.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ForwardedPort>> {
        self.active_tx.subscribe()
    }

    /// Forwarded ports requested by `plan`, keyed by relay id.
    fn requested_ports(
        &self,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> Result<BTreeMap<String, ForwardedPort>> {
        let mut ports = BTreeMap::new();
        for (container, pairs) in plan {
            let endpoints = mapping.get(container).map(Vec::as_slice).unwrap_or_default();
            for pair in pairs {
                let Some(endpoint) = endpoints.iter().find(|e| e.target_port == pair.remote) else {
                    warn!(container = %container, port = pair.remote, "planned port matches no endpoint");
                    continue;
                };
                let local = match pair.local {
                    Some(local) => local,
                    None => ephemeral_port(&self.settings.local_address)?,
                };
                let port = ForwardedPort::for_endpoint(
                    Platform::Podman,
                    container,
                    endpoint,
                    self.settings.local_address.clone(),
                    local,
                );
                ports.insert(relay_id(&port), port);
            }
        }
        Ok(ports)
    }

    async fn stop_session(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        debug!(pod = %session.pod, relays = session.relay_ids.len(), "stopping relays");

        let mut stops = JoinSet::new();
        for id in session.relay_ids {
            let manager = Arc::clone(&self.manager);
            let pod = session.pod.clone();
            let container = self.settings.helper_container.clone();
            let timeout = self.settings.stop_timeout;
            stops.spawn(async move {
                match tokio::time::timeout(timeout, manager.stop_process(&pod, &container, &id)).await
                {
                    Ok(Ok(())) => trace!(id = %id, "relay stopped"),
                    Ok(Err(e)) => warn!(id = %id, error = %e, "unable to stop relay"),
                    Err(_) => warn!(id = %id, timeout = ?timeout, "relay did not stop in time"),
                }
            });
        }
        while let Some(joined) = stops.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "relay stop task ended abnormally");
            }
        }

        let _ = session.shutdown_tx.send(());
        match session.coordinator.await {
            Ok(cleared) => cleared,
            Err(e) => {
                warn!(error = %e, "relay coordinator ended abnormally");
                Ok(())
            }
        }
    }

    async fn start_session(
        &self,
        component: &str,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> Result<()> {
        let requested = self.requested_ports(mapping, plan)?;
        if requested.is_empty() {
            debug!(component, "no port planned, no relay started");
            return Ok(());
        }

        let pod = component.to_string();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (activation_tx, activation_rx) = oneshot::channel();
        let coordinator = tokio::spawn(
            Coordinator {
                requested: requested.clone(),
                active: BTreeMap::new(),
                ended: BTreeSet::new(),
                activation: Some(activation_tx),
                store: Arc::clone(&self.store),
                output: self.output.clone(),
                active_tx: self.active_tx.clone(),
                persist_error_tx: self.persist_error_tx.clone(),
            }
            .run(events_rx, shutdown_rx),
        );
        *self.session.lock() = Some(ExecSession {
            pod: pod.clone(),
            component: component.to_string(),
            plan: plan.clone(),
            relay_ids: requested.keys().cloned().collect(),
            shutdown_tx,
            coordinator,
        });

        let mut submitted = 0;
        for (id, port) in &requested {
            let command = CommandDefinition {
                id: id.clone(),
                working_dir: self.settings.working_dir.clone(),
                command_line: relay_command_line(
                    &self.settings.relay_binary,
                    port.relay_protocol(),
                    port.local_port,
                    port.container_port,
                ),
            };
            debug!(id = %id, command = %command.command_line, "starting relay");
            match self
                .manager
                .start_process(&pod, &self.settings.helper_container, &command, events_tx.clone())
                .await
            {
                Ok(()) => submitted += 1,
                Err(e) => warn!(id = %id, error = %e, "unable to start relay"),
            }
        }

        if submitted == 0 {
            return self
                .abort_session(Error::Setup(format!("no relay could be started in pod {pod}")))
                .await;
        }

        let timeout = self.settings.activation_timeout;
        match tokio::time::timeout(timeout, activation_rx).await {
            Ok(Ok(Ok(()))) => {
                info!(pod = %pod, relays = submitted, "relays started");
                Ok(())
            }
            Ok(Ok(Err(e))) => self.abort_session(e).await,
            Ok(Err(_)) => {
                let e = Error::Setup(format!("relay coordinator of pod {pod} ended"));
                self.abort_session(e).await
            }
            Err(_) => self.abort_session(Error::ActivationTimeout(timeout)).await,
        }
    }

    /// Stops the session being started and reports `error`.
    async fn abort_session(&self, error: Error) -> Result<()> {
        if let Err(e) = self.stop_session().await {
            debug!(error = %e, "forwarded ports not cleared");
        }
        Err(error)
    }
}

impl<P: RemoteProcessManager> TunnelBackend for ExecPortForwarder<P> {
    fn platform(&self) -> Platform {
        Platform::Podman
    }

    async fn start(
        &self,
        component: &str,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> Result<()> {
        let _op = self.op_lock.lock().await;
        let unchanged = self
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.component == component && s.plan == *plan);
        if unchanged {
            debug!(component, "relays already serve the requested ports");
            return Ok(());
        }
        self.stop_session().await?;
        self.start_session(component, mapping, plan).await
    }

    async fn stop(&self) -> Result<()> {
        let _op = self.op_lock.lock().await;
        self.stop_session().await
    }

    fn is_running(&self) -> bool {
        self.session.lock().is_some()
    }

    fn forwarded_ports(&self) -> Vec<ForwardedPort> {
        self.active_tx.borrow().clone()
    }

    fn persist_errors(&self) -> watch::Receiver<Option<String>> {
        self.persist_error_tx.subscribe()
    }
}

/// Sole owner of the active port set of one session.
struct Coordinator {
    requested: BTreeMap<String, ForwardedPort>,
    active: BTreeMap<String, ForwardedPort>,
    /// Relays that stopped or errored.
    ended: BTreeSet<String>,
    /// Receives the outcome of the first save, or the failure of every relay.
    activation: Option<oneshot::Sender<Result<()>>>,
    store: Arc<StateStore>,
    output: SharedOutput,
    active_tx: watch::Sender<Vec<ForwardedPort>>,
    persist_error_tx: watch::Sender<Option<String>>,
}

impl Coordinator {
    /// Runs until shutdown, then clears the recorded ports.
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ProcessEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle(event).await,
                _ = &mut shutdown => break,
            }
        }

        while let Ok(event) = events.try_recv() {
            self.handle(event).await;
        }
        if self.active.is_empty() {
            return Ok(());
        }
        self.active.clear();
        self.publish().await
    }

    async fn handle(&mut self, event: ProcessEvent) {
        let Some(port) = self.requested.get(&event.id).cloned() else {
            trace!(id = %event.id, status = %event.status, "event of unknown relay");
            return;
        };

        match event.status {
            RemoteProcessStatus::Starting => trace!(id = %event.id, "relay starting"),
            RemoteProcessStatus::Running => {
                {
                    let mut out = self.output.lock();
                    if let Err(e) = writeln!(out, "{ECHO_PREFIX}{}", port.confirmation_line()) {
                        debug!(error = %e, "unable to write confirmation");
                    }
                }
                self.ended.remove(&event.id);
                self.active.insert(event.id, port);
                let saved = self.publish().await;
                self.report(saved);
            }
            RemoteProcessStatus::Stopped | RemoteProcessStatus::Errored => {
                if event.status == RemoteProcessStatus::Stopped {
                    info!(
                        local_port = port.local_port,
                        container_port = port.container_port,
                        container = %port.container_name,
                        "port forwarding stopped"
                    );
                } else {
                    debug!(
                        id = %event.id,
                        error = event.error.as_deref().unwrap_or_default(),
                        "relay errored"
                    );
                }
                self.ended.insert(event.id.clone());
                if self.active.remove(&event.id).is_some() {
                    let saved = self.publish().await;
                    self.report(saved);
                }
                if self.ended.len() == self.requested.len() {
                    if let Some(activation) = self.activation.take() {
                        let _ = activation.send(Err(Error::Setup(
                            "every relay ended before forwarding".to_string(),
                        )));
                    }
                }
            }
        }
    }

    /// Saves then publishes the active ports.
    async fn publish(&self) -> Result<()> {
        let ports: Vec<ForwardedPort> = self.active.values().cloned().collect();
        let saved = self.store.set_forwarded_ports(ports.clone()).await;
        self.active_tx.send_replace(ports);
        saved
    }

    /// Hands the first save result to `start`, and later ones to observers.
    fn report(&mut self, saved: Result<()>) {
        if let Some(activation) = self.activation.take() {
            let _ = activation.send(saved);
            return;
        }
        match saved {
            Ok(()) => {
                self.persist_error_tx.send_if_modified(|current| current.take().is_some());
            }
            Err(e) => {
                warn!(error = %e, "unable to save forwarded ports");
                self.persist_error_tx.send_replace(Some(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    use crate::domain::{Endpoint, PortPair};
    use tempfile::tempdir;

    /// Process manager reporting `Running` on start and `Stopped` on stop.
    #[derive(Clone, Default)]
    struct FakeManager {
        started: Arc<Mutex<Vec<CommandDefinition>>>,
        stopped: Arc<Mutex<Vec<String>>>,
        senders: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ProcessEvent>>>>,
        failing: HashSet<String>,
        hanging: HashSet<String>,
    }

    fn event(id: &str, status: RemoteProcessStatus) -> ProcessEvent {
        ProcessEvent {
            id: id.to_string(),
            status,
            error: None,
        }
    }

    impl RemoteProcessManager for FakeManager {
        async fn start_process(
            &self,
            _pod: &str,
            _container: &str,
            command: &CommandDefinition,
            events: mpsc::UnboundedSender<ProcessEvent>,
        ) -> Result<()> {
            self.started.lock().push(command.clone());
            let _ = events.send(event(&command.id, RemoteProcessStatus::Starting));
            let status = if self.failing.contains(&command.id) {
                RemoteProcessStatus::Errored
            } else {
                RemoteProcessStatus::Running
            };
            let _ = events.send(event(&command.id, status));
            self.senders.lock().insert(command.id.clone(), events);
            Ok(())
        }

        async fn stop_process(&self, _pod: &str, _container: &str, id: &str) -> Result<()> {
            if self.hanging.contains(id) {
                std::future::pending::<()>().await;
            }
            self.stopped.lock().push(id.to_string());
            if let Some(events) = self.senders.lock().get(id) {
                let _ = events.send(event(id, RemoteProcessStatus::Stopped));
            }
            Ok(())
        }
    }

    fn mapping() -> ContainerEndpointMap {
        let mut mapping = BTreeMap::new();
        mapping.insert(
            "runtime".to_string(),
            vec![
                Endpoint::new("http", 3000),
                Endpoint::new("dns", 5353).with_protocol(Protocol::Udp),
            ],
        );
        mapping
    }

    fn plan() -> PortPlan {
        let mut plan = PortPlan::new();
        plan.insert(
            "runtime".to_string(),
            vec![PortPair::new(20001, 3000), PortPair::new(20002, 5353)],
        );
        plan
    }

    fn forwarder(
        manager: FakeManager,
        dir: &std::path::Path,
    ) -> (ExecPortForwarder<FakeManager>, Arc<StateStore>) {
        let store = Arc::new(StateStore::for_current_process(dir, Platform::Podman));
        let settings = RelaySettings {
            activation_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let output: SharedOutput = Arc::new(Mutex::new(Box::new(std::io::sink())));
        let fwd = ExecPortForwarder::new(manager, Arc::clone(&store), output, settings);
        (fwd, store)
    }

    async fn wait_active(fwd: &ExecPortForwarder<FakeManager>, count: usize) {
        let mut rx = fwd.subscribe();
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|ports| ports.len() == count))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_relay_command_line() {
        assert_eq!(
            relay_command_line("socat", Protocol::Tcp, 20001, 8080),
            "socat -d tcp-listen:20001,reuseaddr,fork tcp:localhost:8080"
        );
        assert_eq!(
            relay_command_line("socat", Protocol::Udp, 20002, 53),
            "socat -d udp-listen:20002,reuseaddr,fork udp:localhost:53"
        );
    }

    #[test]
    fn test_relay_id() {
        let port = ForwardedPort {
            container_name: "runtime".to_string(),
            port_name: "http".to_string(),
            ..Default::default()
        };
        assert_eq!(relay_id(&port), "pf-runtime-http");
    }

    #[tokio::test]
    async fn test_start_runs_one_relay_per_port() {
        let dir = tempdir().unwrap();
        let manager = FakeManager::default();
        let (fwd, store) = forwarder(manager.clone(), dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        wait_active(&fwd, 2).await;

        let started = manager.started.lock().clone();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0].id, "pf-runtime-dns");
        assert_eq!(
            started[0].command_line,
            "socat -d udp-listen:20002,reuseaddr,fork udp:localhost:5353"
        );
        assert_eq!(started[1].working_dir, "/tmp");

        let ports = fwd.forwarded_ports();
        assert!(ports.iter().all(|p| p.platform == Platform::Podman));
        assert_eq!(store.read().await.unwrap().forwarded_ports, ports);

        fwd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_errored_relay_does_not_stop_others() {
        let dir = tempdir().unwrap();
        let manager = FakeManager {
            failing: HashSet::from(["pf-runtime-dns".to_string()]),
            ..Default::default()
        };
        let (fwd, _store) = forwarder(manager, dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        wait_active(&fwd, 1).await;

        let ports = fwd.forwarded_ports();
        assert_eq!(ports[0].port_name, "http");
        assert!(fwd.is_running());
        fwd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_with_same_plan_is_noop() {
        let dir = tempdir().unwrap();
        let manager = FakeManager::default();
        let (fwd, _store) = forwarder(manager.clone(), dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        fwd.start("app", &mapping(), &plan()).await.unwrap();
        assert_eq!(manager.started.lock().len(), 2);
        assert!(manager.stopped.lock().is_empty());

        fwd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_does_not_wait_on_unresponsive_relay() {
        let dir = tempdir().unwrap();
        let manager = FakeManager {
            hanging: HashSet::from(["pf-runtime-dns".to_string()]),
            ..Default::default()
        };
        let (fwd, store) = forwarder(manager.clone(), dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        wait_active(&fwd, 2).await;
        fwd.stop().await.unwrap();

        assert_eq!(manager.stopped.lock().clone(), vec!["pf-runtime-http".to_string()]);
        assert!(fwd.forwarded_ports().is_empty());
        assert!(!fwd.is_running());
        assert!(store.read().await.unwrap().forwarded_ports.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_ports_cannot_be_saved() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let manager = FakeManager::default();
        let (fwd, store) = forwarder(manager.clone(), &blocker.join("state"));

        let result = fwd.start("app", &mapping(), &plan()).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(store.set_forwarded_ports(Vec::new()).await.is_err());

        assert!(!fwd.is_running());
        assert!(fwd.forwarded_ports().is_empty());
        assert_eq!(manager.stopped.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_start_fails_when_every_relay_errors() {
        let dir = tempdir().unwrap();
        let manager = FakeManager {
            failing: HashSet::from(["pf-runtime-dns".to_string(), "pf-runtime-http".to_string()]),
            ..Default::default()
        };
        let (fwd, store) = forwarder(manager, dir.path());

        let result = fwd.start("app", &mapping(), &plan()).await;
        assert!(matches!(result, Err(Error::Setup(_))));
        assert!(!fwd.is_running());
        assert!(store.read().await.is_err());
    }

    #[tokio::test]
    async fn test_later_save_failure_is_observable() {
        let dir = tempdir().unwrap();
        let state_dir = dir.path().join("state");
        let manager = FakeManager::default();
        let (fwd, _store) = forwarder(manager.clone(), &state_dir);

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        wait_active(&fwd, 2).await;
        let mut errors = fwd.persist_errors();
        assert!(errors.borrow().is_none());

        std::fs::remove_dir_all(&state_dir).unwrap();
        std::fs::write(&state_dir, "").unwrap();
        let relay = manager.senders.lock().get("pf-runtime-http").cloned().unwrap();
        relay.send(event("pf-runtime-http", RemoteProcessStatus::Errored)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), errors.wait_for(Option::is_some))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fwd.forwarded_ports().len(), 1);
        let _ = fwd.stop().await;
    }

    #[tokio::test]
    async fn test_ephemeral_pairs_get_os_ports() {
        let dir = tempdir().unwrap();
        let (fwd, _store) = forwarder(FakeManager::default(), dir.path());
        let mut plan = PortPlan::new();
        plan.insert("runtime".to_string(), vec![PortPair::ephemeral(3000)]);

        fwd.start("app", &mapping(), &plan).await.unwrap();
        wait_active(&fwd, 1).await;
        assert_ne!(fwd.forwarded_ports()[0].local_port, 0);
        fwd.stop().await.unwrap();
    }
}
