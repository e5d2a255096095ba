//! Error types for the devforward-core library.

use thiserror::Error;

/// Result type alias for devforward operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while planning, establishing and tracking port forwards.
#[derive(Error, Debug)]
pub enum Error {
    /// A forwarding session could not be set up (pod lookup, transport open).
    #[error("Unable to setup port forwarding: {0}")]
    Setup(String),

    /// The first batch of forwarded ports never completed.
    #[error("Unable to setup port forwarding: no confirmation received within {0:?}")]
    ActivationTimeout(std::time::Duration),

    /// The tunnel transport failed; recovered by the supervision loop.
    #[error("Port forwarding transport failed: {0}")]
    Transport(String),

    /// A single line of tool output could not be parsed.
    #[error("Failed to parse output: {0}")]
    Parse(String),

    /// A `--port-forward` value does not follow the accepted grammar.
    #[error("Invalid port forwarding definition {spec:?}: {reason}")]
    InvalidPortSpec { spec: String, reason: String },

    /// A port forwarding definition references a container that declares no endpoint.
    #[error("Container {0:?} defined for port forwarding not found")]
    UnknownContainer(String),

    /// A container port does not match any endpoint of the named container.
    #[error("Container port {port} does not match any endpoint of container {container:?}")]
    UnmatchedContainerPort { container: String, port: u16 },

    /// A container port without container name is declared by several containers.
    #[error(
        "Multiple containers ({}) declare container port {port}; use <localPort>:<containerName>:<containerPort>",
        containers.join(", ")
    )]
    AmbiguousContainerPort { port: u16, containers: Vec<String> },

    /// The same local port is requested more than once.
    #[error("Local port {0} is used more than once, please use unique local ports")]
    DuplicateLocalPort(u16),

    /// Mutually exclusive options were combined.
    #[error("Incompatible options: {0}")]
    IncompatibleOptions(String),

    /// Some container ports never started listening before the deadline.
    #[error("Timeout while checking for ports; ports not listening: ({0})")]
    PortsNotListening(String),

    /// Invalid polling timeout.
    #[error("Invalid timeout {timeout:?}, must be strictly greater than {min:?}")]
    InvalidTimeout {
        timeout: std::time::Duration,
        min: std::time::Duration,
    },

    /// Another live session already forwards ports on this platform.
    #[error("A session is already running on platform {platform} with pid {pid}")]
    AlreadyRunning { platform: String, pid: u32 },

    /// Failed to execute a command.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// A required executable could not be found.
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
