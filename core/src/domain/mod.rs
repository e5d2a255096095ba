//! Domain layer - Pure data models.
//!
//! Endpoints declared by a component, the forwarded ports derived from them,
//! and the connections observed in container socket tables.
//! These types have no I/O dependencies and can be tested in isolation.

mod connection;
mod endpoint;
mod forwarded_port;

pub use connection::{Connection, TcpState};
pub use endpoint::{
    container_endpoint_map, containers_declaring, endpoint_count, find_endpoint, is_debug_port,
    ContainerComponent, ContainerEndpointMap, Endpoint, Exposure, Protocol,
    DEBUG_ENDPOINT_PREFIX,
};
pub use forwarded_port::{
    parse_port_forward_flag, validate_port_forward_specs, ForwardedPort, Platform, PortPair,
};
