//! PID-file based supervision of background commands in a container.
//!
//! A command is launched through the container shell, which records its own
//! PID in `<pid dir>/.odo_cmd_<id>.pid` before running the command with its
//! output redirected to the streams of the container's PID 1. Status checks
//! and termination only rely on that file and on `/proc`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::backoff::ExpBackoff;
use crate::connections::SHELL_EXECUTABLE;
use crate::error::{Error, Result};
use crate::ports::{
    CommandDefinition, ExecClient, ProcessEvent, RemoteProcessManager, RemoteProcessStatus,
};

/// Directory holding PID files when none is configured.
pub const DEFAULT_PID_DIR: &str = "/opt/odo";

/// Delays between status checks after a kill signal.
const KILL_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Bounds of the delay between liveness checks of a command just launched.
const VERIFY_INITIAL_DELAY: Duration = Duration::from_millis(100);
const VERIFY_MAX_DELAY: Duration = Duration::from_secs(2);

const OUTPUT_REDIRECT: &str = "1>>/proc/1/fd/1 2>>/proc/1/fd/2";

fn shell(script: String) -> Vec<String> {
    vec![SHELL_EXECUTABLE.to_string(), "-c".to_string(), script]
}

fn event(id: &str, status: RemoteProcessStatus, error: Option<String>) -> ProcessEvent {
    ProcessEvent {
        id: id.to_string(),
        status,
        error,
    }
}

/// [`RemoteProcessManager`] tracking commands through PID files.
///
/// A started command is reported `Starting`, then `Running` once its PID file
/// names a live process, and `Stopped` or `Errored` when it ends.
pub struct PidFileProcessManager<E: ExecClient> {
    exec: Arc<E>,
    pid_dir: String,
    retry_schedule: Vec<Duration>,
    /// Commands being stopped on purpose, keyed by `pod/container/id`.
    stopping: Arc<Mutex<HashSet<String>>>,
}

impl<E: ExecClient> Clone for PidFileProcessManager<E> {
    fn clone(&self) -> Self {
        Self {
            exec: Arc::clone(&self.exec),
            pid_dir: self.pid_dir.clone(),
            retry_schedule: self.retry_schedule.clone(),
            stopping: Arc::clone(&self.stopping),
        }
    }
}

impl<E: ExecClient> PidFileProcessManager<E> {
    pub fn new(exec: E, pid_dir: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(exec), pid_dir)
    }

    pub fn from_arc(exec: Arc<E>, pid_dir: impl Into<String>) -> Self {
        Self {
            exec,
            pid_dir: pid_dir.into().trim_end_matches('/').to_string(),
            retry_schedule: KILL_RETRY_SCHEDULE.to_vec(),
            stopping: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replaces the delays between status checks after a kill.
    pub fn with_retry_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.retry_schedule = schedule;
        self
    }

    /// PID file of the command `id`.
    pub fn pid_file(&self, id: &str) -> String {
        format!("{}/.odo_cmd_{id}.pid", self.pid_dir)
    }

    /// Shell script launching `command` and recording the shell PID.
    pub fn launch_script(&self, command: &CommandDefinition) -> String {
        let pid_file = self.pid_file(&command.id);
        if command.working_dir.is_empty() {
            format!(
                "echo $$ > {pid_file} && ({}) {OUTPUT_REDIRECT}",
                command.command_line
            )
        } else {
            format!(
                "echo $$ > {pid_file} && cd {} && ({}) {OUTPUT_REDIRECT}",
                command.working_dir, command.command_line
            )
        }
    }

    /// PID recorded for `id`, 0 when none.
    async fn read_pid(&self, pod: &str, container: &str, id: &str) -> Result<u32> {
        let pid_file = self.pid_file(id);
        let lines = self
            .exec
            .execute_command(pod, container, &shell(format!("cat {pid_file} || true")))
            .await?;

        let lines: Vec<&str> = lines.iter().map(|l| l.trim()).filter(|l| !l.is_empty()).collect();
        match lines.as_slice() {
            [] => Ok(0),
            [line] => line.parse().map_err(|_| {
                Error::Parse(format!("unexpected content for {pid_file}: {line}"))
            }),
            _ => Err(Error::Parse(format!(
                "unexpected number of lines for {pid_file}: {lines:?}"
            ))),
        }
    }

    async fn pid_status(&self, pod: &str, container: &str, pid: u32) -> Result<RemoteProcessStatus> {
        if pid == 0 {
            return Ok(RemoteProcessStatus::Stopped);
        }
        let lines = self
            .exec
            .execute_command(pod, container, &shell(format!("kill -0 {pid}; echo $?")))
            .await?;
        let code: i32 = lines
            .first()
            .map(|l| l.trim())
            .unwrap_or_default()
            .parse()
            .map_err(|_| Error::Parse(format!("unexpected status output for process {pid}: {lines:?}")))?;
        Ok(if code == 0 {
            RemoteProcessStatus::Running
        } else {
            RemoteProcessStatus::Stopped
        })
    }

    async fn children(&self, pod: &str, container: &str, pid: u32) -> Result<Vec<u32>> {
        let lines = self
            .exec
            .execute_command(
                pod,
                container,
                &shell(format!("cat /proc/{pid}/task/{pid}/children || true")),
            )
            .await?;
        lines
            .iter()
            .flat_map(|l| l.split_whitespace())
            .map(|p| {
                p.parse()
                    .map_err(|_| Error::Parse(format!("invalid child pid of {pid}: {p}")))
            })
            .collect()
    }

    /// Current status of the command `id`.
    pub async fn get_process_status(
        &self,
        pod: &str,
        container: &str,
        id: &str,
    ) -> Result<RemoteProcessStatus> {
        let pid = self.read_pid(pod, container, id).await?;
        self.pid_status(pod, container, pid).await
    }

    /// Signals `pid` and waits until it is gone.
    async fn kill(&self, pod: &str, container: &str, pid: u32) -> Result<()> {
        self.exec
            .execute_command(pod, container, &shell(format!("kill {pid} || true")))
            .await?;

        let mut delays = self.retry_schedule.iter();
        loop {
            match self.pid_status(pod, container, pid).await {
                Ok(RemoteProcessStatus::Stopped) => return Ok(()),
                Ok(status) => trace!(pid, status = %status, "process still alive"),
                Err(e) => debug!(pid, error = %e, "unable to check process status"),
            }
            match delays.next() {
                Some(delay) => tokio::time::sleep(*delay).await,
                None => {
                    return Err(Error::CommandFailed(format!(
                        "remote process {pid} still running after kill"
                    )))
                }
            }
        }
    }

    async fn kill_tree(&self, pod: &str, container: &str, id: &str) -> Result<()> {
        let pid = self.read_pid(pod, container, id).await?;
        if pid == 0 {
            return Ok(());
        }
        let children = self.children(pod, container, pid).await?;
        if children.is_empty() {
            return self.kill(pod, container, pid).await;
        }
        for child in children {
            self.kill(pod, container, child).await?;
        }
        Ok(())
    }
}

fn stopping_key(pod: &str, container: &str, id: &str) -> String {
    format!("{pod}/{container}/{id}")
}

impl<E: ExecClient> RemoteProcessManager for PidFileProcessManager<E> {
    async fn start_process(
        &self,
        pod: &str,
        container: &str,
        command: &CommandDefinition,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> Result<()> {
        let key = stopping_key(pod, container, &command.id);
        self.stopping.lock().remove(&key);

        let script = shell(self.launch_script(command));
        let manager = self.clone();
        let (pod, container, id) = (pod.to_string(), container.to_string(), command.id.clone());
        debug!(id = %id, pod = %pod, container = %container, "starting background command");

        let _ = events.send(event(&id, RemoteProcessStatus::Starting, None));
        tokio::spawn(async move {
            let run = manager.exec.execute_command(&pod, &container, &script);
            tokio::pin!(run);

            let mut verify = ExpBackoff::new(VERIFY_INITIAL_DELAY, VERIFY_MAX_DELAY);
            let mut verified = false;
            let result = loop {
                tokio::select! {
                    result = &mut run => break result,
                    _ = tokio::time::sleep(verify.delay()), if !verified => {
                        match manager.get_process_status(&pod, &container, &id).await {
                            Ok(RemoteProcessStatus::Running) => {
                                verified = true;
                                let _ = events.send(event(&id, RemoteProcessStatus::Running, None));
                            }
                            Ok(status) => trace!(id = %id, status = %status, "command not running yet"),
                            Err(e) => debug!(id = %id, error = %e, "unable to check command status"),
                        }
                    }
                }
            };

            let stopped_on_purpose = manager.stopping.lock().remove(&key);
            let ended = match result {
                Ok(_) => event(&id, RemoteProcessStatus::Stopped, None),
                Err(_) if stopped_on_purpose => event(&id, RemoteProcessStatus::Stopped, None),
                Err(e) => {
                    debug!(id = %id, error = %e, "background command failed");
                    event(&id, RemoteProcessStatus::Errored, Some(e.to_string()))
                }
            };
            let _ = events.send(ended);
        });
        Ok(())
    }

    async fn stop_process(&self, pod: &str, container: &str, id: &str) -> Result<()> {
        debug!(id, pod, container, "stopping background command");
        self.stopping.lock().insert(stopping_key(pod, container, id));

        let result = self.kill_tree(pod, container, id).await;

        let pid_file = self.pid_file(id);
        if let Err(e) = self
            .exec
            .execute_command(pod, container, &shell(format!("rm -f {pid_file}")))
            .await
        {
            warn!(file = %pid_file, error = %e, "could not remove PID file");
        }
        result
    }
}
