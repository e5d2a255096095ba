//! Cluster tunnel backend.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{TunnelBackend, TunnelState};
use crate::backoff::ExpBackoff;
use crate::config::ForwardingConfig;
use crate::domain::{ContainerEndpointMap, ForwardedPort, Platform, PortPair};
use crate::error::{Error, Result};
use crate::planner::{flatten, PortPlan};
use crate::ports::{ClusterClient, PodRef, TunnelEvent};
use crate::scraper::{PortWriter, SharedOutput};
use crate::state::StateStore;

/// A running supervision loop.
struct Session {
    stop_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

/// State shared between the backend and its supervision loop.
struct Shared<C> {
    client: Arc<C>,
    store: Arc<StateStore>,
    output: SharedOutput,
    forwarded: RwLock<Vec<ForwardedPort>>,
    state_tx: watch::Sender<TunnelState>,
    persist_error_tx: watch::Sender<Option<String>>,
    backoff_initial: Duration,
    backoff_max: Duration,
}

/// Forwards every endpoint of a component over one cluster tunnel.
///
/// The tunnel runs in a background task that restarts it with exponential
/// backoff when the transport fails, and immediately when the transport
/// reports a lost connection. Each complete batch of confirmations replaces
/// the forwarded ports and is saved to the state store.
pub struct KubePortForwarder<C: ClusterClient> {
    shared: Arc<Shared<C>>,
    activation_timeout: Duration,
    session: Mutex<Option<Session>>,
    op_lock: tokio::sync::Mutex<()>,
}

impl<C: ClusterClient> KubePortForwarder<C> {
    pub fn new(
        client: C,
        store: Arc<StateStore>,
        output: SharedOutput,
        config: &ForwardingConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Idle);
        let (persist_error_tx, _) = watch::channel(None);
        Self {
            shared: Arc::new(Shared {
                client: Arc::new(client),
                store,
                output,
                forwarded: RwLock::new(Vec::new()),
                state_tx,
                persist_error_tx,
                backoff_initial: config.backoff_initial(),
                backoff_max: config.backoff_max(),
            }),
            activation_timeout: config.activation_timeout(),
            session: Mutex::new(None),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Observe the tunnel state machine.
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.shared.state_tx.subscribe()
    }

    pub fn state(&self) -> TunnelState {
        *self.shared.state_tx.borrow()
    }

    /// Stops the supervision loop, then clears the saved ports if a batch
    /// was recorded.
    async fn stop_session(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        self.shared.state_tx.send_replace(TunnelState::Stopping);
        // The loop may already have exited, in which case the channel is closed.
        let _ = session.stop_tx.send(()).await;
        if let Err(e) = session.task.await {
            warn!(error = %e, "port forwarding task ended abnormally");
        }
        let recorded = std::mem::take(&mut *self.shared.forwarded.write());
        self.shared.state_tx.send_replace(TunnelState::Idle);
        debug!("port forwarding stopped");
        if recorded.is_empty() {
            return Ok(());
        }
        self.shared.store.set_forwarded_ports(Vec::new()).await
    }

    async fn start_session(
        &self,
        component: &str,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> Result<()> {
        let pairs = flatten(plan);
        if pairs.is_empty() {
            debug!(component, "no port pair planned, no tunnel opened");
            return Ok(());
        }

        self.shared.state_tx.send_replace(TunnelState::Starting);
        let pod = match self.shared.client.get_pod_for_component(component).await {
            Ok(pod) => pod,
            Err(e) => {
                self.shared.state_tx.send_replace(TunnelState::Idle);
                return Err(match e {
                    Error::Setup(_) => e,
                    other => Error::Setup(format!("unable to find pod of {component}: {other}")),
                });
            }
        };
        info!(pod = %pod.name, pairs = pairs.len(), "starting port forwarding");

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (activation_tx, mut activation_rx) = mpsc::channel(1);
        let task = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            pod,
            pairs,
            mapping.clone(),
            stop_rx,
            activation_tx,
        ));
        *self.session.lock() = Some(Session { stop_tx, task });

        let outcome = match tokio::time::timeout(self.activation_timeout, activation_rx.recv()).await
        {
            Ok(Some(Ok(()))) => return Ok(()),
            Ok(Some(Err(e))) => e,
            Ok(None) => Error::Setup("port forwarding ended before any port was forwarded".to_string()),
            Err(_) => Error::ActivationTimeout(self.activation_timeout),
        };
        if let Err(e) = self.stop_session().await {
            debug!(error = %e, "forwarded ports not cleared");
        }
        Err(outcome)
    }
}

impl<C: ClusterClient> TunnelBackend for KubePortForwarder<C> {
    fn platform(&self) -> Platform {
        Platform::Cluster
    }

    async fn start(
        &self,
        component: &str,
        mapping: &ContainerEndpointMap,
        plan: &PortPlan,
    ) -> Result<()> {
        let _op = self.op_lock.lock().await;
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
        self.shared.forwarded.read().clone()
    }

    fn persist_errors(&self) -> watch::Receiver<Option<String>> {
        self.shared.persist_error_tx.subscribe()
    }
}

/// Waits for a complete batch, publishes and saves it.
///
/// Returns `Ok(false)` when the tunnel ended before every pair confirmed.
async fn persist_batch<C>(
    shared: &Shared<C>,
    batch: oneshot::Receiver<Vec<ForwardedPort>>,
) -> Result<bool> {
    let Ok(ports) = batch.await else {
        return Ok(false);
    };
    *shared.forwarded.write() = ports.clone();
    shared.state_tx.send_replace(TunnelState::Running);
    shared.store.set_forwarded_ports(ports).await?;
    Ok(true)
}

/// Supervision loop of one session.
async fn supervise<C: ClusterClient>(
    shared: Arc<Shared<C>>,
    pod: PodRef,
    pairs: Vec<PortPair>,
    mapping: ContainerEndpointMap,
    mut stop_rx: mpsc::Receiver<()>,
    activation_tx: mpsc::Sender<Result<()>>,
) {
    let mut backoff = ExpBackoff::new(shared.backoff_initial, shared.backoff_max);
    let mut first = true;

    loop {
        if !first {
            shared.state_tx.send_replace(TunnelState::Restarting);
        }
        first = false;

        let (writer, batch) = PortWriter::new(shared.output.clone(), pairs.len(), mapping.clone());
        let persist = tokio::spawn({
            let shared = Arc::clone(&shared);
            let activation_tx = activation_tx.clone();
            async move {
                let result = persist_batch(&shared, batch).await;
                match result {
                    Ok(false) => {}
                    Ok(true) => {
                        let _ = activation_tx.try_send(Ok(()));
                        shared
                            .persist_error_tx
                            .send_if_modified(|current| current.take().is_some());
                    }
                    Err(e) => {
                        warn!(error = %e, "port forwarding state not saved");
                        // Once started, the failure goes to observers instead.
                        if let Err(TrySendError::Closed(Err(e)) | TrySendError::Full(Err(e))) =
                            activation_tx.try_send(Err(e))
                        {
                            shared.persist_error_tx.send_replace(Some(e.to_string()));
                        }
                    }
                }
            }
        });

        let (tunnel_stop_tx, tunnel_stop_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut tunnel_stop = Some(tunnel_stop_tx);
        let mut stop_requested = false;
        let mut lost_connection = false;

        let tunnel = shared.client.port_forward(
            &pod,
            &pairs,
            Box::new(writer),
            tunnel_stop_rx,
            events_tx,
        );
        tokio::pin!(tunnel);

        let result = loop {
            tokio::select! {
                res = &mut tunnel => break res,
                _ = stop_rx.recv(), if !stop_requested => {
                    stop_requested = true;
                    if let Some(tx) = tunnel_stop.take() {
                        let _ = tx.send(());
                    }
                }
                Some(event) = events_rx.recv() => match event {
                    TunnelEvent::LostConnection(reason) => {
                        warn!(pod = %pod.name, reason = %reason, "lost connection to pod, restarting port forwarding");
                        lost_connection = true;
                        if let Some(tx) = tunnel_stop.take() {
                            let _ = tx.send(());
                        }
                    }
                },
            }
        };

        // No write to the forwarded ports may happen once the loop is left.
        if let Err(e) = persist.await {
            warn!(error = %e, "port forwarding state task ended abnormally");
        }

        if stop_requested {
            break;
        }

        match result {
            Ok(()) => {
                backoff.reset();
                if !lost_connection {
                    debug!(pod = %pod.name, "port forwarding ended, restarting");
                }
            }
            Err(e) => {
                let delay = backoff.delay();
                warn!(error = %e, retry_in = ?delay, "Failed to setup port-forwarding");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.recv() => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::Endpoint;
    use tempfile::tempdir;

    /// Cluster client printing one confirmation per pair.
    ///
    /// The first `failures` tunnels fail right away. When `lose_connection`
    /// is set, the first successful tunnel reports a lost connection.
    struct FakeCluster {
        opened: Arc<AtomicUsize>,
        failures: usize,
        lose_connection: bool,
        confirm: bool,
    }

    impl FakeCluster {
        fn new() -> Self {
            Self {
                opened: Arc::new(AtomicUsize::new(0)),
                failures: 0,
                lose_connection: false,
                confirm: true,
            }
        }
    }

    impl ClusterClient for FakeCluster {
        async fn get_pod_for_component(&self, component: &str) -> Result<PodRef> {
            if component == "missing" {
                return Err(Error::CommandFailed("no pod".to_string()));
            }
            Ok(PodRef::new(format!("{component}-pod")))
        }

        async fn port_forward(
            &self,
            _pod: &PodRef,
            pairs: &[PortPair],
            mut out: Box<dyn Write + Send>,
            stop: oneshot::Receiver<()>,
            events: mpsc::UnboundedSender<TunnelEvent>,
        ) -> Result<()> {
            let attempt = self.opened.fetch_add(1, Ordering::SeqCst);
            if attempt < self.failures {
                return Err(Error::Transport("connection refused".to_string()));
            }
            if self.confirm {
                for pair in pairs {
                    let local = pair.local.unwrap_or(40000 + pair.remote);
                    writeln!(out, "Forwarding from 127.0.0.1:{} -> {}", local, pair.remote)?;
                }
            }
            if self.lose_connection && attempt == self.failures {
                let _ = events.send(TunnelEvent::LostConnection("lost connection to pod".into()));
            }
            let _ = stop.await;
            Ok(())
        }
    }

    fn mapping() -> ContainerEndpointMap {
        let mut mapping = BTreeMap::new();
        mapping.insert(
            "runtime".to_string(),
            vec![Endpoint::new("http", 3000), Endpoint::new("admin", 3001)],
        );
        mapping
    }

    fn plan() -> PortPlan {
        let mut plan = PortPlan::new();
        plan.insert(
            "runtime".to_string(),
            vec![PortPair::new(20001, 3000), PortPair::new(20002, 3001)],
        );
        plan
    }

    fn config() -> ForwardingConfig {
        ForwardingConfig {
            activation_timeout_secs: 2,
            backoff_initial_millis: 10,
            backoff_max_secs: 1,
            ..Default::default()
        }
    }

    fn sink() -> SharedOutput {
        Arc::new(Mutex::new(Box::new(std::io::sink())))
    }

    fn forwarder(
        client: FakeCluster,
        dir: &std::path::Path,
    ) -> (KubePortForwarder<FakeCluster>, Arc<StateStore>) {
        let store = Arc::new(StateStore::for_current_process(dir, Platform::Cluster));
        let fwd = KubePortForwarder::new(client, Arc::clone(&store), sink(), &config());
        (fwd, store)
    }

    #[tokio::test]
    async fn test_start_waits_for_all_confirmations() {
        let dir = tempdir().unwrap();
        let (fwd, store) = forwarder(FakeCluster::new(), dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();

        let ports = fwd.forwarded_ports();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port_name, "http");
        assert_eq!(ports[1].local_port, 20002);
        assert_eq!(fwd.state(), TunnelState::Running);
        assert_eq!(store.read().await.unwrap().forwarded_ports, ports);

        fwd.stop().await.unwrap();
        assert!(fwd.forwarded_ports().is_empty());
        assert!(!fwd.is_running());
        assert_eq!(fwd.state(), TunnelState::Idle);
    }

    #[tokio::test]
    async fn test_stop_clears_saved_ports() {
        let dir = tempdir().unwrap();
        let (fwd, store) = forwarder(FakeCluster::new(), dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        assert_eq!(store.read().await.unwrap().forwarded_ports.len(), 2);

        fwd.stop().await.unwrap();
        assert!(store.read().await.unwrap().forwarded_ports.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_when_ports_cannot_be_saved() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let (fwd, _store) = forwarder(FakeCluster::new(), &blocker.join("state"));

        let err = fwd.start("app", &mapping(), &plan()).await.unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(!fwd.is_running());
        assert!(fwd.forwarded_ports().is_empty());
    }

    #[tokio::test]
    async fn test_start_restarts_after_transport_failures() {
        let dir = tempdir().unwrap();
        let client = FakeCluster {
            failures: 2,
            ..FakeCluster::new()
        };
        let opened = Arc::clone(&client.opened);
        let (fwd, _store) = forwarder(client, dir.path());

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        assert_eq!(opened.load(Ordering::SeqCst), 3);
        assert_eq!(fwd.forwarded_ports().len(), 2);
        fwd.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_lost_connection_reopens_tunnel() {
        let dir = tempdir().unwrap();
        let client = FakeCluster {
            lose_connection: true,
            ..FakeCluster::new()
        };
        let opened = Arc::clone(&client.opened);
        let (fwd, _store) = forwarder(client, dir.path());
        let mut states = fwd.subscribe();

        fwd.start("app", &mapping(), &plan()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while opened.load(Ordering::SeqCst) < 2 {
                states.changed().await.unwrap();
            }
        })
        .await
        .unwrap();

        fwd.stop().await.unwrap();
        assert_eq!(fwd.state(), TunnelState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activation_timeout_stops_session() {
        let dir = tempdir().unwrap();
        let client = FakeCluster {
            confirm: false,
            ..FakeCluster::new()
        };
        let (fwd, store) = forwarder(client, dir.path());

        let err = fwd.start("app", &mapping(), &plan()).await.unwrap_err();
        assert!(matches!(err, Error::ActivationTimeout(_)));
        assert!(!fwd.is_running());
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn test_pod_lookup_failure_is_setup_error() {
        let dir = tempdir().unwrap();
        let (fwd, _store) = forwarder(FakeCluster::new(), dir.path());

        let err = fwd.start("missing", &mapping(), &plan()).await.unwrap_err();
        assert!(matches!(err, Error::Setup(_)));
        assert!(!fwd.is_running());
    }

    #[tokio::test]
    async fn test_empty_plan_opens_nothing() {
        let dir = tempdir().unwrap();
        let client = FakeCluster::new();
        let opened = Arc::clone(&client.opened);
        let (fwd, _store) = forwarder(client, dir.path());

        fwd.start("app", &mapping(), &PortPlan::new()).await.unwrap();
        assert!(!fwd.is_running());
        assert_eq!(opened.load(Ordering::SeqCst), 0);
    }
}
