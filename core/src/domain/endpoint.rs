//! Container endpoint domain models.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Name (or name prefix followed by `-`) identifying a debug endpoint.
pub const DEBUG_ENDPOINT_PREFIX: &str = "debug";

// ============================================================================
// Exposure / Protocol
// ============================================================================

/// Visibility class of a declared endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Exposure {
    #[default]
    Public,
    Internal,
    None,
}

impl Exposure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Internal => "internal",
            Self::None => "none",
        }
    }
}

impl fmt::Display for Exposure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport protocol of a declared endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Endpoint
// ============================================================================

/// A network port declared by a container of the component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: u16,
    #[serde(default)]
    pub exposure: Exposure,
    #[serde(default)]
    pub protocol: Protocol,
}

impl Endpoint {
    /// Creates a public TCP endpoint.
    pub fn new(name: impl Into<String>, target_port: u16) -> Self {
        Self {
            name: name.into(),
            target_port,
            exposure: Exposure::default(),
            protocol: Protocol::default(),
        }
    }

    pub fn with_exposure(mut self, exposure: Exposure) -> Self {
        self.exposure = exposure;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Whether this endpoint is reserved for a debugger.
    pub fn is_debug(&self) -> bool {
        is_debug_port(&self.name)
    }
}

/// Returns true for `debug` and `debug-*` endpoint names.
pub fn is_debug_port(name: &str) -> bool {
    name == DEBUG_ENDPOINT_PREFIX
        || name
            .strip_prefix(DEBUG_ENDPOINT_PREFIX)
            .is_some_and(|rest| rest.starts_with('-'))
}

// ============================================================================
// Container endpoint mapping
// ============================================================================

/// Endpoints exposed by each container, keyed by container name.
///
/// Ordered by container name, so every lookup that scans the map resolves ties
/// to the lexicographically smallest container.
pub type ContainerEndpointMap = BTreeMap<String, Vec<Endpoint>>;

/// A container declared by the component, as produced by the component parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerComponent {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

/// Builds the endpoint map from the component containers.
///
/// Endpoints with exposure `none` are never forwarded. Debug endpoints are kept
/// only when `include_debug` is set. Containers left without endpoints are omitted.
pub fn container_endpoint_map(
    containers: &[ContainerComponent],
    include_debug: bool,
) -> ContainerEndpointMap {
    let mut mapping = ContainerEndpointMap::new();
    for container in containers {
        let endpoints: Vec<Endpoint> = container
            .endpoints
            .iter()
            .filter(|e| e.exposure != Exposure::None)
            .filter(|e| include_debug || !e.is_debug())
            .cloned()
            .collect();
        if endpoints.is_empty() {
            continue;
        }
        mapping
            .entry(container.name.clone())
            .or_default()
            .extend(endpoints);
    }
    mapping
}

/// Finds the first endpoint whose target port is `container_port`.
pub fn find_endpoint(
    mapping: &ContainerEndpointMap,
    container_port: u16,
) -> Option<(&str, &Endpoint)> {
    mapping.iter().find_map(|(container, endpoints)| {
        endpoints
            .iter()
            .find(|e| e.target_port == container_port)
            .map(|e| (container.as_str(), e))
    })
}

/// Lists the containers declaring `container_port`.
pub fn containers_declaring(mapping: &ContainerEndpointMap, container_port: u16) -> Vec<String> {
    mapping
        .iter()
        .filter(|(_, endpoints)| endpoints.iter().any(|e| e.target_port == container_port))
        .map(|(container, _)| container.clone())
        .collect()
}

/// Total number of endpoints in the mapping.
pub fn endpoint_count(mapping: &ContainerEndpointMap) -> usize {
    mapping.values().map(Vec::len).sum()
}
