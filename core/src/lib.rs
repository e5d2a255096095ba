//! devforward Core Library
//!
//! Port-forwarding and connection-tracking engine for container inner-loop
//! development. Provides functionality to:
//! - Derive the endpoints of a component that need a tunnel and plan local ports
//! - Forward them over a supervised cluster tunnel or per-port relays in a container
//! - Recover the forwarded ports from the tunnel's confirmation output
//! - Inspect container socket tables to check which ports are listening
//! - Persist the forwarded ports of each session for other processes to query
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `domain`: Pure data models
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`: External system implementations (kubectl, PID-file processes)
//! - `application`: Use case services
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use devforward_core::{
//!     scraper, ForwardingConfig, ForwardingService, KubePortForwarder, KubectlClient, Platform,
//!     StartOptions, StateStore,
//! };
//!
//! # async fn run(containers: Vec<devforward_core::ContainerComponent>) -> devforward_core::Result<()> {
//! let config = ForwardingConfig::default();
//! let store = Arc::new(StateStore::for_current_process(&config.state_dir, Platform::Cluster));
//! let backend = KubePortForwarder::new(
//!     KubectlClient::from_config(&config),
//!     Arc::clone(&store),
//!     scraper::stdout_output(),
//!     &config,
//! );
//! let service = ForwardingService::new(backend, store, config.base_port, config.port_range);
//! service.start_port_forwarding("my-app", &containers, StartOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

// Hexagonal architecture layers
pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub mod backoff;
pub mod config;
pub mod connections;
pub mod error;
pub mod forwarder;
pub mod planner;
pub mod scraper;
pub mod state;

// Re-export domain types (primary API)
pub use domain::{
    container_endpoint_map, parse_port_forward_flag, Connection, ContainerComponent,
    ContainerEndpointMap, Endpoint, Exposure, ForwardedPort, Platform, PortPair, Protocol,
    TcpState,
};

// Re-export other commonly used types
pub use adapters::{KubectlClient, PidFileProcessManager};
pub use application::{ForwardingService, StartOptions, StartOutcome};
pub use config::{ConfigStore, ForwardingConfig};
pub use connections::ConnectionScanner;
pub use error::{Error, Result};
pub use forwarder::{ExecPortForwarder, KubePortForwarder, RelaySettings, TunnelBackend, TunnelState};
pub use planner::{PlanMode, PortPlan, PortPlanner};
pub use state::{SessionState, StateStore};
