//! Cluster access through the `kubectl` binary.

mod models;

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::config::ForwardingConfig;
use crate::domain::PortPair;
use crate::error::{Error, Result};
use crate::ports::{ClusterClient, ExecClient, PodRef, TunnelEvent};

use models::PodListResponse;

/// Default paths to search for kubectl.
const KUBECTL_PATHS: &[&str] = &[
    "/opt/homebrew/bin/kubectl", // Apple Silicon
    "/usr/local/bin/kubectl",    // Intel Mac / Homebrew
    "/usr/bin/kubectl",          // System
];

/// Timeout for one-shot kubectl commands.
const KUBECTL_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the output of an exited `kubectl port-forward` is still read.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Marker written on stderr by `kubectl port-forward` when the stream to the pod drops.
pub const LOST_CONNECTION_MARKER: &str = "lost connection to pod";

/// Label selecting the pods of a component.
const COMPONENT_LABEL: &str = "component";

/// [`ClusterClient`] and [`ExecClient`] backed by kubectl.
#[derive(Debug, Clone)]
pub struct KubectlClient {
    kubectl_path: Option<PathBuf>,
    namespace: Option<String>,
    local_address: String,
}

impl KubectlClient {
    /// Creates a client, searching kubectl in the default locations.
    pub fn new() -> Self {
        Self::with_path(find_executable(KUBECTL_PATHS))
    }

    /// Creates a client with a custom kubectl path.
    pub fn with_path(kubectl_path: Option<PathBuf>) -> Self {
        Self {
            kubectl_path,
            namespace: None,
            local_address: "127.0.0.1".to_string(),
        }
    }

    pub fn from_config(config: &ForwardingConfig) -> Self {
        let kubectl_path = config
            .kubectl_path
            .clone()
            .or_else(|| find_executable(KUBECTL_PATHS));
        let client = Self {
            kubectl_path,
            namespace: None,
            local_address: config.local_address.clone(),
        };
        match &config.namespace {
            Some(namespace) => client.with_namespace(namespace.clone()),
            None => client,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Returns the kubectl path if found.
    pub fn kubectl_path(&self) -> Option<&PathBuf> {
        self.kubectl_path.as_ref()
    }

    /// Returns true if kubectl is available.
    pub fn is_available(&self) -> bool {
        self.kubectl_path.is_some()
    }

    fn kubectl(&self) -> Result<&PathBuf> {
        self.kubectl_path
            .as_ref()
            .ok_or_else(|| Error::ExecutableNotFound("kubectl".to_string()))
    }

    fn namespace_args(&self, namespace: Option<&str>) -> Vec<String> {
        match namespace.or(self.namespace.as_deref()) {
            Some(ns) => vec!["-n".to_string(), ns.to_string()],
            None => Vec::new(),
        }
    }

    /// Arguments of `kubectl port-forward` for `pairs`.
    pub fn port_forward_args(&self, pod: &PodRef, pairs: &[PortPair]) -> Vec<String> {
        let mut args = vec!["port-forward".to_string(), format!("pod/{}", pod.name)];
        args.extend(pairs.iter().map(PortPair::to_string));
        args.push("--address".to_string());
        args.push(self.local_address.clone());
        args.extend(self.namespace_args(pod.namespace.as_deref()));
        args
    }

    /// Arguments of `kubectl exec` running `command` in `container`.
    pub fn exec_args(&self, pod: &str, container: &str, command: &[String]) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            pod.to_string(),
            "-c".to_string(),
            container.to_string(),
        ];
        args.extend(self.namespace_args(None));
        args.push("--".to_string());
        args.extend(command.iter().cloned());
        args
    }

    /// Executes a kubectl command and returns its stdout.
    async fn execute_kubectl(&self, args: &[String]) -> Result<String> {
        let kubectl_path = self.kubectl()?;
        trace!(args = ?args, "running kubectl");

        let result = timeout(KUBECTL_TIMEOUT, async {
            Command::new(kubectl_path)
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
        })
        .await;

        match result {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(Error::CommandFailed(format!(
                    "kubectl {} exited with {}: {}",
                    args.first().map(String::as_str).unwrap_or_default(),
                    output.status,
                    stderr.trim()
                )))
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::CommandFailed(format!(
                "kubectl timed out after {:?}",
                KUBECTL_TIMEOUT
            ))),
        }
    }
}

impl Default for KubectlClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterClient for KubectlClient {
    async fn get_pod_for_component(&self, component: &str) -> Result<PodRef> {
        let mut args = vec![
            "get".to_string(),
            "pods".to_string(),
            "-l".to_string(),
            format!("{COMPONENT_LABEL}={component}"),
            "-o".to_string(),
            "json".to_string(),
        ];
        args.extend(self.namespace_args(None));

        let output = self.execute_kubectl(&args).await?;
        let response: PodListResponse =
            serde_json::from_str(&output).map_err(|e| Error::Parse(e.to_string()))?;
        response
            .into_running_pod()
            .ok_or_else(|| Error::Setup(format!("no running pod found for component {component}")))
    }

    async fn port_forward(
        &self,
        pod: &PodRef,
        pairs: &[PortPair],
        mut out: Box<dyn Write + Send>,
        mut stop: oneshot::Receiver<()>,
        events: mpsc::UnboundedSender<TunnelEvent>,
    ) -> Result<()> {
        let kubectl_path = self.kubectl()?;
        let args = self.port_forward_args(pod, pairs);
        debug!(pod = %pod.name, args = ?args, "opening tunnel");

        let mut child = Command::new(kubectl_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Transport(format!("failed to start kubectl: {e}")))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(Error::Transport("kubectl output not captured".to_string()));
        };
        let mut stdout = BufReader::new(stdout).lines();
        let mut stderr = BufReader::new(stderr).lines();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut last_error = String::new();

        loop {
            tokio::select! {
                line = stdout.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        writeln!(out, "{line}")?;
                        out.flush()?;
                    }
                    _ => stdout_open = false,
                },
                line = stderr.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        if line.contains(LOST_CONNECTION_MARKER) {
                            let _ = events.send(TunnelEvent::LostConnection(line.clone()));
                        } else {
                            debug!(pod = %pod.name, "kubectl: {line}");
                        }
                        last_error = line;
                    }
                    _ => stderr_open = false,
                },
                status = child.wait() => {
                    let status = status?;
                    // Lines written before the exit may still sit in the pipes.
                    let drained = timeout(DRAIN_TIMEOUT, async {
                        while let Ok(Some(line)) = stdout.next_line().await {
                            writeln!(out, "{line}")?;
                        }
                        while let Ok(Some(line)) = stderr.next_line().await {
                            debug!(pod = %pod.name, "kubectl: {line}");
                            last_error = line;
                        }
                        Ok::<(), Error>(())
                    })
                    .await;
                    match drained {
                        Ok(result) => result?,
                        Err(_) => debug!(pod = %pod.name, "kubectl output still open after exit"),
                    }
                    out.flush()?;
                    if status.success() {
                        return Ok(());
                    }
                    return Err(Error::Transport(format!(
                        "kubectl port-forward exited with {status}: {last_error}"
                    )));
                }
                _ = &mut stop => {
                    if let Err(e) = child.kill().await {
                        debug!(error = %e, "kubectl already exited");
                    }
                    out.flush()?;
                    return Ok(());
                }
            }
        }
    }
}

impl ExecClient for KubectlClient {
    async fn execute_command(
        &self,
        pod: &str,
        container: &str,
        command: &[String],
    ) -> Result<Vec<String>> {
        let output = self
            .execute_kubectl(&self.exec_args(pod, container, command))
            .await?;
        Ok(output.lines().map(str::to_string).collect())
    }
}

/// Finds an executable in the given paths.
fn find_executable(paths: &[&str]) -> Option<PathBuf> {
    paths.iter().map(PathBuf::from).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tempfile::TempDir;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Buffer {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    /// Writes an executable shell script standing in for kubectl.
    #[cfg(unix)]
    fn fake_kubectl(body: &str) -> (TempDir, KubectlClient) {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kubectl");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        (dir, KubectlClient::with_path(Some(path)))
    }

    #[test]
    fn test_find_executable() {
        assert!(find_executable(&["/bin/sh", "/usr/bin/sh"]).is_some());
        assert!(find_executable(&["/nonexistent/path"]).is_none());
    }

    #[test]
    fn test_port_forward_args() {
        let client = KubectlClient::with_path(None).with_namespace("dev");
        let pod = PodRef::new("app-7f9c");
        let args = client.port_forward_args(&pod, &[PortPair::new(20001, 8080), PortPair::ephemeral(5858)]);
        assert_eq!(
            args,
            vec![
                "port-forward",
                "pod/app-7f9c",
                "20001:8080",
                ":5858",
                "--address",
                "127.0.0.1",
                "-n",
                "dev"
            ]
        );
    }

    #[test]
    fn test_exec_args() {
        let client = KubectlClient::with_path(None);
        let command = vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()];
        assert_eq!(
            client.exec_args("app", "runtime", &command),
            vec!["exec", "app", "-c", "runtime", "--", "/bin/sh", "-c", "echo hi"]
        );
    }

    #[tokio::test]
    async fn test_missing_kubectl() {
        let client = KubectlClient::with_path(None);
        let result = client.get_pod_for_component("app").await;
        assert!(matches!(result, Err(Error::ExecutableNotFound(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_returns_stdout_lines() {
        let (_dir, client) = fake_kubectl("echo one\necho two");
        let lines = client
            .execute_command("app", "runtime", &["true".to_string()])
            .await
            .unwrap();
        assert_eq!(lines, vec!["one", "two"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_failure_is_command_failed() {
        let (_dir, client) = fake_kubectl("echo 'container not found' >&2\nexit 1");
        let err = client
            .execute_command("app", "runtime", &["true".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CommandFailed(msg) if msg.contains("container not found")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_get_pod_for_component() {
        let (_dir, client) = fake_kubectl(
            r#"echo '{"items":[{"metadata":{"name":"app-1"},"status":{"phase":"Running"}}]}'"#,
        );
        let pod = client.get_pod_for_component("app").await.unwrap();
        assert_eq!(pod.name, "app-1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_forward_streams_output_until_stopped() {
        let (_dir, client) = fake_kubectl(
            "echo 'Forwarding from 127.0.0.1:20001 -> 8080'\n\
             echo 'E1016 portforward.go: lost connection to pod' >&2\n\
             exec sleep 30",
        );
        let buffer = Buffer::default();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let buffer = buffer.clone();
            async move {
                client
                    .port_forward(
                        &PodRef::new("app-1"),
                        &[PortPair::new(20001, 8080)],
                        Box::new(buffer),
                        stop_rx,
                        events_tx,
                    )
                    .await
            }
        });

        let event = tokio::time::timeout(Duration::from_secs(5), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TunnelEvent::LostConnection(_)));

        tokio::time::timeout(Duration::from_secs(5), async {
            while !buffer.contents().contains("Forwarding from") {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        stop_tx.send(()).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(buffer.contents(), "Forwarding from 127.0.0.1:20001 -> 8080\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_forward_keeps_output_written_before_exit() {
        let (_dir, client) = fake_kubectl(
            "i=0\n\
             while [ $i -lt 200 ]; do\n\
             echo \"Forwarding from 127.0.0.1:$((20000 + i)) -> 8080\"\n\
             i=$((i + 1))\n\
             done",
        );
        let buffer = Buffer::default();
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        client
            .port_forward(
                &PodRef::new("app-1"),
                &[PortPair::new(20001, 8080)],
                Box::new(buffer.clone()),
                stop_rx,
                events_tx,
            )
            .await
            .unwrap();

        let contents = buffer.contents();
        assert_eq!(contents.lines().count(), 200);
        assert!(contents.ends_with("Forwarding from 127.0.0.1:20199 -> 8080\n"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_port_forward_failure_is_transport_error() {
        let (_dir, client) = fake_kubectl("echo 'unable to listen on port 20001' >&2\nexit 1");
        let (_stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let err = client
            .port_forward(
                &PodRef::new("app-1"),
                &[PortPair::new(20001, 8080)],
                Box::new(std::io::sink()),
                stop_rx,
                events_tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transport(msg) if msg.contains("unable to listen on port 20001")));
    }
}
