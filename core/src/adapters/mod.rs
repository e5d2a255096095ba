//! Adapters layer - External system implementations.
//!
//! This module contains implementations of the port traits defined in `ports`.
//! Each adapter handles communication with external systems.

pub mod kubectl;
pub mod remote_process;

// Re-export main types for convenience
pub use kubectl::KubectlClient;
pub use remote_process::PidFileProcessManager;
