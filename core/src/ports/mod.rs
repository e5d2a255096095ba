//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces the forwarding engine uses to reach
//! the cluster and the containers. Implementations live in `adapters`.

mod cluster;
mod exec;
mod process;

pub use cluster::{ClusterClient, PodRef, TunnelEvent};
pub use exec::ExecClient;
pub use process::{CommandDefinition, ProcessEvent, RemoteProcessManager, RemoteProcessStatus};
