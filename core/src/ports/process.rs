//! Remote process manager port (interface).

use std::fmt;

use tokio::sync::mpsc;

use crate::error::Result;

/// A named background command to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDefinition {
    pub id: String,
    pub working_dir: String,
    pub command_line: String,
}

/// Lifecycle of a remote background process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteProcessStatus {
    Starting,
    Running,
    Stopped,
    Errored,
}

impl RemoteProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Errored => "errored",
        }
    }
}

impl fmt::Display for RemoteProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status transition reported for the command with the given id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEvent {
    pub id: String,
    pub status: RemoteProcessStatus,
    pub error: Option<String>,
}

/// Port for supervising background commands inside a container.
pub trait RemoteProcessManager: Send + Sync + 'static {
    /// Launch `command` in the background and return once it is submitted.
    ///
    /// Every status transition is sent on `events`.
    fn start_process(
        &self,
        pod: &str,
        container: &str,
        command: &CommandDefinition,
        events: mpsc::UnboundedSender<ProcessEvent>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Terminate the command with the given id and wait until it is gone.
    fn stop_process(
        &self,
        pod: &str,
        container: &str,
        id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
