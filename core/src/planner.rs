//! Local port planning.
//!
//! Turns a [`ContainerEndpointMap`] into the `local:remote` pairs handed to a
//! tunnel backend. Three modes are supported:
//! - sequential: free host ports scanned upward from a base port
//! - random: the tunnel lets the OS pick every local port
//! - fixed: user-supplied pairs, with sequential ports for the remaining endpoints
//!
//! Free ports are not reserved between the probe and the tunnel bind, so two
//! sessions planning at the same time may pick the same port.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};

use tracing::{debug, warn};

use crate::domain::{
    endpoint_count, validate_port_forward_specs, ContainerEndpointMap, ForwardedPort, PortPair,
};
use crate::error::{Error, Result};

/// First local port tried in sequential mode.
pub const DEFAULT_BASE_PORT: u16 = 20001;

/// Number of ports scanned above the base port.
pub const DEFAULT_PORT_RANGE: u16 = 10000;

/// Pairs assigned to each container, in endpoint order.
pub type PortPlan = BTreeMap<String, Vec<PortPair>>;

/// How local ports are chosen.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlanMode {
    #[default]
    Sequential,
    Random,
    Fixed(Vec<ForwardedPort>),
}

/// Tells whether a local port can be bound.
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probes ports by binding a listener on the loopback interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPortProbe;

impl PortProbe for LocalPortProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)).is_ok()
    }
}

/// Asks the OS for a free port on `address`.
pub fn ephemeral_port(address: &str) -> Result<u16> {
    let listener = TcpListener::bind((address, 0))?;
    Ok(listener.local_addr()?.port())
}

/// Assigns local ports to endpoints.
pub struct PortPlanner<P: PortProbe = LocalPortProbe> {
    base_port: u16,
    range: u16,
    probe: P,
}

impl PortPlanner<LocalPortProbe> {
    pub fn new(base_port: u16, range: u16) -> Self {
        Self::with_probe(base_port, range, LocalPortProbe)
    }
}

impl Default for PortPlanner<LocalPortProbe> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT, DEFAULT_PORT_RANGE)
    }
}

impl<P: PortProbe> PortPlanner<P> {
    pub fn with_probe(base_port: u16, range: u16, probe: P) -> Self {
        Self {
            base_port,
            range,
            probe,
        }
    }

    fn end_port(&self) -> u16 {
        self.base_port.saturating_add(self.range)
    }

    /// First free port in `start..=end`.
    fn next_free_port(&self, start: u16, end: u16) -> Option<u16> {
        (start..=end).find(|p| *p != 0 && self.probe.is_free(*p))
    }

    /// Plans pairs for every endpoint of `mapping`.
    pub fn plan(&self, mapping: &ContainerEndpointMap, mode: &PlanMode) -> Result<PortPlan> {
        let plan = match mode {
            PlanMode::Sequential => self.sequential(mapping, &HashSet::new(), &[]),
            PlanMode::Random => random(mapping),
            PlanMode::Fixed(specs) => {
                validate_port_forward_specs(specs, mapping)?;
                let used: HashSet<u16> = specs.iter().map(|s| s.local_port).collect();
                self.sequential(mapping, &used, specs)
            }
        };
        debug!(
            endpoints = endpoint_count(mapping),
            planned = plan.values().map(Vec::len).sum::<usize>(),
            "planned port pairs"
        );
        Ok(plan)
    }

    fn sequential(
        &self,
        mapping: &ContainerEndpointMap,
        used: &HashSet<u16>,
        specs: &[ForwardedPort],
    ) -> PortPlan {
        let end = self.end_port();
        let mut cursor = self.base_port;
        let mut plan = PortPlan::new();

        for (container, endpoints) in mapping {
            for endpoint in endpoints {
                if let Some(local) = fixed_local_port(specs, container, endpoint.target_port) {
                    plan.entry(container.clone())
                        .or_default()
                        .push(PortPair::new(local, endpoint.target_port));
                    continue;
                }

                let mut found = None;
                let mut start = cursor;
                while start <= end {
                    match self.next_free_port(start, end) {
                        Some(p) if used.contains(&p) => match p.checked_add(1) {
                            Some(next) => start = next,
                            None => break,
                        },
                        Some(p) => {
                            found = Some(p);
                            break;
                        }
                        None => break,
                    }
                }

                match found {
                    Some(local) => {
                        plan.entry(container.clone())
                            .or_default()
                            .push(PortPair::new(local, endpoint.target_port));
                        cursor = local.saturating_add(1);
                    }
                    None => warn!(
                        container = %container,
                        endpoint = %endpoint.name,
                        start = cursor,
                        end,
                        "no free local port in range, endpoint not forwarded"
                    ),
                }
            }
        }
        plan
    }
}

/// Local port requested by the user for `container_port` of `container`.
fn fixed_local_port(specs: &[ForwardedPort], container: &str, container_port: u16) -> Option<u16> {
    specs
        .iter()
        .find(|s| {
            s.container_port == container_port
                && (s.container_name.is_empty() || s.container_name == container)
        })
        .map(|s| s.local_port)
}

fn random(mapping: &ContainerEndpointMap) -> PortPlan {
    mapping
        .iter()
        .map(|(container, endpoints)| {
            let pairs = endpoints
                .iter()
                .map(|e| PortPair::ephemeral(e.target_port))
                .collect();
            (container.clone(), pairs)
        })
        .collect()
}

/// Flattens a plan into the pair list of a single tunnel.
pub fn flatten(plan: &PortPlan) -> Vec<PortPair> {
    plan.values().flatten().copied().collect()
}

/// Resolves the mode requested by the caller.
pub fn plan_mode(random_ports: bool, defined_ports: Vec<ForwardedPort>) -> Result<PlanMode> {
    match (random_ports, defined_ports.is_empty()) {
        (true, false) => Err(Error::IncompatibleOptions(
            "random ports and custom port definitions cannot be used together".to_string(),
        )),
        (true, true) => Ok(PlanMode::Random),
        (false, false) => Ok(PlanMode::Fixed(defined_ports)),
        (false, true) => Ok(PlanMode::Sequential),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Endpoint;

    /// Probe reporting a fixed set of busy ports.
    struct BusyPorts(HashSet<u16>);

    impl PortProbe for BusyPorts {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn planner(busy: &[u16]) -> PortPlanner<BusyPorts> {
        PortPlanner::with_probe(20001, 10000, BusyPorts(busy.iter().copied().collect()))
    }

    fn mapping() -> ContainerEndpointMap {
        let mut mapping = ContainerEndpointMap::new();
        mapping.insert(
            "runtime".to_string(),
            vec![Endpoint::new("http", 3000), Endpoint::new("admin", 3001)],
        );
        mapping.insert("tools".to_string(), vec![Endpoint::new("tools", 5000)]);
        mapping
    }

    fn spec(local: u16, container: &str, remote: u16) -> ForwardedPort {
        ForwardedPort {
            container_name: container.to_string(),
            local_port: local,
            container_port: remote,
            ..Default::default()
        }
    }

    fn pairs(plan: &PortPlan, container: &str) -> Vec<String> {
        plan[container].iter().map(PortPair::to_string).collect()
    }

    #[test]
    fn test_sequential_skips_busy_ports() {
        let plan = planner(&[20002]).plan(&mapping(), &PlanMode::Sequential).unwrap();
        assert_eq!(pairs(&plan, "runtime"), vec!["20001:3000", "20003:3001"]);
        assert_eq!(pairs(&plan, "tools"), vec!["20004:5000"]);
    }

    #[test]
    fn test_sequential_assigns_unique_ports() {
        let plan = planner(&[]).plan(&mapping(), &PlanMode::Sequential).unwrap();
        let locals: HashSet<u16> = flatten(&plan).iter().filter_map(|p| p.local).collect();
        assert_eq!(locals.len(), 3);
    }

    #[test]
    fn test_sequential_skips_endpoint_when_range_exhausted() {
        let planner = PortPlanner::with_probe(20001, 1, BusyPorts(HashSet::new()));
        let plan = planner.plan(&mapping(), &PlanMode::Sequential).unwrap();
        assert_eq!(pairs(&plan, "runtime"), vec!["20001:3000", "20002:3001"]);
        assert!(!plan.contains_key("tools"));
    }

    #[test]
    fn test_random_uses_ephemeral_pairs() {
        let plan = planner(&[]).plan(&mapping(), &PlanMode::Random).unwrap();
        assert_eq!(pairs(&plan, "runtime"), vec![":3000", ":3001"]);
        assert_eq!(pairs(&plan, "tools"), vec![":5000"]);
    }

    #[test]
    fn test_fixed_mixes_user_and_sequential_ports() {
        let specs = vec![spec(20001, "", 5000), spec(8080, "runtime", 3001)];
        let plan = planner(&[]).plan(&mapping(), &PlanMode::Fixed(specs)).unwrap();
        assert_eq!(pairs(&plan, "runtime"), vec!["20002:3000", "8080:3001"]);
        assert_eq!(pairs(&plan, "tools"), vec!["20001:5000"]);
    }

    #[test]
    fn test_fixed_rejects_unknown_container_port() {
        let specs = vec![spec(8080, "runtime", 9999)];
        let result = planner(&[]).plan(&mapping(), &PlanMode::Fixed(specs));
        assert!(matches!(result, Err(Error::UnmatchedContainerPort { .. })));
    }

    #[test]
    fn test_flatten_keeps_container_order() {
        let plan = planner(&[]).plan(&mapping(), &PlanMode::Sequential).unwrap();
        let flat: Vec<String> = flatten(&plan).iter().map(PortPair::to_string).collect();
        assert_eq!(flat, vec!["20001:3000", "20002:3001", "20003:5000"]);
    }

    #[test]
    fn test_plan_mode_rejects_random_with_defined_ports() {
        assert!(matches!(
            plan_mode(true, vec![spec(8080, "", 3000)]),
            Err(Error::IncompatibleOptions(_))
        ));
        assert_eq!(plan_mode(true, vec![]).unwrap(), PlanMode::Random);
        assert_eq!(plan_mode(false, vec![]).unwrap(), PlanMode::Sequential);
    }

    #[test]
    fn test_ephemeral_port_is_bindable() {
        let port = ephemeral_port("127.0.0.1").unwrap();
        assert_ne!(port, 0);
    }
}
