//! Forwarded port domain models and the `--port-forward` definition grammar.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::endpoint::{containers_declaring, ContainerEndpointMap, Endpoint, Exposure, Protocol};
use crate::error::{Error, Result};

// ============================================================================
// Platform
// ============================================================================

/// Where the component runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Orchestration cluster, reached through a multiplexed streaming tunnel.
    #[default]
    Cluster,
    /// Local container runtime, reached through per-port relays.
    Podman,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::Cluster, Platform::Podman];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::Podman => "podman",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cluster" => Ok(Self::Cluster),
            "podman" => Ok(Self::Podman),
            other => Err(Error::Config(format!("unknown platform {other:?}"))),
        }
    }
}

// ============================================================================
// ForwardedPort
// ============================================================================

fn is_false(b: &bool) -> bool {
    !*b
}

/// An active forwarding from a local port to a container port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedPort {
    #[serde(default)]
    pub platform: Platform,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub container_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub port_name: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_debug: bool,
    #[serde(default)]
    pub local_address: String,
    pub local_port: u16,
    pub container_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure: Option<Exposure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl ForwardedPort {
    /// Builds the record for `endpoint` of `container` forwarded on `local_address:local_port`.
    pub fn for_endpoint(
        platform: Platform,
        container: &str,
        endpoint: &Endpoint,
        local_address: impl Into<String>,
        local_port: u16,
    ) -> Self {
        Self {
            platform,
            container_name: container.to_string(),
            port_name: endpoint.name.clone(),
            is_debug: endpoint.is_debug(),
            local_address: local_address.into(),
            local_port,
            container_port: endpoint.target_port,
            exposure: Some(endpoint.exposure),
            protocol: Some(endpoint.protocol),
        }
    }

    /// The confirmation line announcing this forwarding.
    pub fn confirmation_line(&self) -> String {
        format!(
            "Forwarding from {}:{} -> {}",
            self.local_address, self.local_port, self.container_port
        )
    }

    /// Protocol used by relays, TCP when unknown.
    pub fn relay_protocol(&self) -> Protocol {
        self.protocol.unwrap_or_default()
    }
}

// ============================================================================
// PortPair
// ============================================================================

/// A `local:remote` pair handed to a tunnel. An empty local side lets the
/// tunnel pick an ephemeral port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub local: Option<u16>,
    pub remote: u16,
}

impl PortPair {
    pub fn new(local: u16, remote: u16) -> Self {
        Self {
            local: Some(local),
            remote,
        }
    }

    pub fn ephemeral(remote: u16) -> Self {
        Self {
            local: None,
            remote,
        }
    }
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.local {
            Some(local) => write!(f, "{}:{}", local, self.remote),
            None => write!(f, ":{}", self.remote),
        }
    }
}

// ============================================================================
// --port-forward definitions
// ============================================================================

const LARGEST_PORT: u32 = 65535;

fn port_forward_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,5})(:\w*)?:(\d{1,5})$").expect("valid regex"))
}

/// Parses `<localPort>:<containerPort>` and `<localPort>:<containerName>:<containerPort>` values.
pub fn parse_port_forward_flag<S: AsRef<str>>(values: &[S]) -> Result<Vec<ForwardedPort>> {
    let mut forwarded = Vec::with_capacity(values.len());
    for value in values {
        let value = value.as_ref();
        let caps = port_forward_regex()
            .captures(value)
            .ok_or_else(|| Error::InvalidPortSpec {
                spec: value.to_string(),
                reason: "acceptable formats are <localPort>:<containerPort> and \
                         <localPort>:<containerName>:<containerPort>"
                    .to_string(),
            })?;

        let parse_port = |s: &str| -> Result<u16> {
            match s.parse::<u32>() {
                Ok(p) if (1..=LARGEST_PORT).contains(&p) => Ok(p as u16),
                _ => Err(Error::InvalidPortSpec {
                    spec: value.to_string(),
                    reason: format!("port number must be between 1 and {LARGEST_PORT}"),
                }),
            }
        };

        let local_port = parse_port(&caps[1])?;
        let container_port = parse_port(&caps[3])?;
        let container_name = caps
            .get(2)
            .map(|m| m.as_str().trim_start_matches(':').to_string())
            .unwrap_or_default();

        forwarded.push(ForwardedPort {
            container_name,
            local_port,
            container_port,
            ..Default::default()
        });
    }
    Ok(forwarded)
}

/// Checks user-supplied definitions against the declared endpoints.
pub fn validate_port_forward_specs(
    specs: &[ForwardedPort],
    mapping: &ContainerEndpointMap,
) -> Result<()> {
    let mut local_ports = HashSet::new();
    for spec in specs {
        if !local_ports.insert(spec.local_port) {
            return Err(Error::DuplicateLocalPort(spec.local_port));
        }
    }

    for spec in specs {
        if !spec.container_name.is_empty() {
            let endpoints = mapping
                .get(&spec.container_name)
                .ok_or_else(|| Error::UnknownContainer(spec.container_name.clone()))?;
            if !endpoints.iter().any(|e| e.target_port == spec.container_port) {
                return Err(Error::UnmatchedContainerPort {
                    container: spec.container_name.clone(),
                    port: spec.container_port,
                });
            }
            continue;
        }

        match containers_declaring(mapping, spec.container_port).as_slice() {
            [] => {
                return Err(Error::UnmatchedContainerPort {
                    container: String::new(),
                    port: spec.container_port,
                })
            }
            [_] => {}
            many => {
                return Err(Error::AmbiguousContainerPort {
                    port: spec.container_port,
                    containers: many.to_vec(),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(local: u16, container: &str, remote: u16) -> ForwardedPort {
        ForwardedPort {
            container_name: container.to_string(),
            local_port: local,
            container_port: remote,
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_flag_without_container() {
        let parsed = parse_port_forward_flag(&["8080:8000", "9090:9000"]).unwrap();
        assert_eq!(parsed, vec![spec(8080, "", 8000), spec(9090, "", 9000)]);
    }

    #[test]
    fn test_parse_flag_with_container() {
        let parsed = parse_port_forward_flag(&["8080:runtime_123:8000", "1:tools:65535"]).unwrap();
        assert_eq!(
            parsed,
            vec![spec(8080, "runtime_123", 8000), spec(1, "tools", 65535)]
        );
    }

    #[test]
    fn test_parse_flag_rejects_invalid_values() {
        assert!(parse_port_forward_flag(&["0:65536"]).is_err());
        assert!(parse_port_forward_flag(&["runtime:8080:8000"]).is_err());
        assert!(parse_port_forward_flag(&["8080:runtime-123:8000"]).is_err());
        assert!(parse_port_forward_flag(&[":8000"]).is_err());
    }

    #[test]
    fn test_port_pair_display() {
        assert_eq!(PortPair::new(20001, 3000).to_string(), "20001:3000");
        assert_eq!(PortPair::ephemeral(3000).to_string(), ":3000");
    }

    fn mapping() -> ContainerEndpointMap {
        let mut mapping = ContainerEndpointMap::new();
        mapping.insert(
            "runtime".to_string(),
            vec![Endpoint::new("http", 8000), Endpoint::new("admin", 9090)],
        );
        mapping.insert("tools".to_string(), vec![Endpoint::new("tools", 9090)]);
        mapping
    }

    #[test]
    fn test_validate_accepts_known_ports() {
        let specs = vec![spec(8080, "", 8000), spec(9091, "tools", 9090)];
        assert!(validate_port_forward_specs(&specs, &mapping()).is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_unknowns() {
        let dup = vec![spec(8080, "", 8000), spec(8080, "tools", 9090)];
        assert!(matches!(
            validate_port_forward_specs(&dup, &mapping()),
            Err(Error::DuplicateLocalPort(8080))
        ));

        let unknown = vec![spec(8080, "missing", 8000)];
        assert!(matches!(
            validate_port_forward_specs(&unknown, &mapping()),
            Err(Error::UnknownContainer(_))
        ));

        let unmatched = vec![spec(8080, "tools", 8000)];
        assert!(matches!(
            validate_port_forward_specs(&unmatched, &mapping()),
            Err(Error::UnmatchedContainerPort { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_ambiguous_container_port() {
        let specs = vec![spec(8080, "", 9090)];
        match validate_port_forward_specs(&specs, &mapping()) {
            Err(Error::AmbiguousContainerPort { port, containers }) => {
                assert_eq!(port, 9090);
                assert_eq!(containers, vec!["runtime", "tools"]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_forwarded_port_json_shape() {
        let port = ForwardedPort::for_endpoint(
            Platform::Cluster,
            "runtime",
            &Endpoint::new("http", 3000),
            "127.0.0.1",
            20001,
        );
        let json = serde_json::to_value(&port).unwrap();
        assert_eq!(json["containerName"], "runtime");
        assert_eq!(json["localAddress"], "127.0.0.1");
        assert_eq!(json["localPort"], 20001);
        assert_eq!(json["containerPort"], 3000);
        assert_eq!(json["platform"], "cluster");
        assert!(json.get("isDebug").is_none());
        assert_eq!(port.confirmation_line(), "Forwarding from 127.0.0.1:20001 -> 3000");
    }
}
