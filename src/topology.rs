//! # Fat-Tree Topology Parameters
//!
//! Every size in the network derives from a single parameter `k`, the number
//! of ports per switch. A k-ary fat-tree has three switch tiers:
//!
//! - k²/4 core switches, each with one port per pod,
//! - k²/2 aggregate switches, k/2 per pod,
//! - k²/2 edge switches, k/2 per pod,
//! - k³/4 endpoints, k/2 behind each edge switch.
//!
//! A `Topology` value is validated once and then threaded through every
//! constructor, so derived counts are computed in exactly one place and no
//! component relies on process-wide state.

use serde::Serialize;

use crate::error::SimError;
use crate::network::message::EndpointId;

/// Validated topology parameters for one simulation run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Topology {
    ports_per_switch: usize,
}

impl Topology {
    /// Validate `k` and derive a topology from it.
    ///
    /// `k` must be even and at least 4; anything smaller cannot form the
    /// three-tier structure.
    pub fn new(ports_per_switch: usize) -> Result<Self, SimError> {
        if ports_per_switch < 4 {
            return Err(SimError::Config(format!(
                "ports per switch ({ports_per_switch}) cannot be less than 4"
            )));
        }

        if ports_per_switch % 2 != 0 {
            return Err(SimError::Config(format!(
                "ports per switch ({ports_per_switch}) must be even"
            )));
        }

        Ok(Self { ports_per_switch })
    }

    /// Ports per switch (`k`).
    pub fn ports_per_switch(&self) -> usize {
        self.ports_per_switch
    }

    /// Up-facing (or down-facing) ports per switch, `k/2`.
    pub fn half_ports(&self) -> usize {
        self.ports_per_switch / 2
    }

    /// Number of core switches, `k²/4`.
    pub fn core_switches(&self) -> usize {
        self.ports_per_switch * self.ports_per_switch / 4
    }

    /// Number of aggregate switches, `k²/2`.
    pub fn aggregate_switches(&self) -> usize {
        self.core_switches() * 2
    }

    /// Number of edge switches, `k²/2`.
    pub fn edge_switches(&self) -> usize {
        self.core_switches() * 2
    }

    /// Number of endpoints, `k³/4`.
    pub fn endpoints(&self) -> usize {
        self.edge_switches() * self.half_ports()
    }

    /// Number of pods. Each pod groups `k/2` aggregate and `k/2` edge switches.
    pub fn pods(&self) -> usize {
        self.ports_per_switch
    }

    /// Aggregate (equivalently edge) switches per pod, `k/2`.
    pub fn pod_size(&self) -> usize {
        self.half_ports()
    }

    /// Endpoints reachable through one core switch port, `(k/2)²`.
    pub fn endpoints_per_core_port(&self) -> usize {
        self.half_ports() * self.half_ports()
    }

    /// First endpoint id served by the given edge switch.
    pub fn edge_first_endpoint(&self, edge_id: usize) -> EndpointId {
        edge_id * self.half_ports()
    }

    /// First endpoint id of the pod containing the given aggregate switch.
    pub fn aggregate_first_endpoint(&self, aggregate_id: usize) -> EndpointId {
        (aggregate_id / self.pod_size()) * self.endpoints_per_core_port()
    }

    /// Core switch port index that serves the given endpoint.
    pub fn core_port_for(&self, endpoint: EndpointId) -> usize {
        endpoint / self.endpoints_per_core_port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivations_for_k4() {
        let topology = Topology::new(4).unwrap();

        assert_eq!(topology.core_switches(), 4);
        assert_eq!(topology.aggregate_switches(), 8);
        assert_eq!(topology.edge_switches(), 8);
        assert_eq!(topology.endpoints(), 16);
        assert_eq!(topology.pods(), 4);
        assert_eq!(topology.pod_size(), 2);
        assert_eq!(topology.endpoints_per_core_port(), 4);
    }

    #[test]
    fn derivations_for_k8() {
        let topology = Topology::new(8).unwrap();

        assert_eq!(topology.core_switches(), 16);
        assert_eq!(topology.aggregate_switches(), 32);
        assert_eq!(topology.edge_switches(), 32);
        assert_eq!(topology.endpoints(), 128);
    }

    #[test]
    fn rejects_invalid_port_counts() {
        assert!(Topology::new(2).is_err());
        assert!(Topology::new(3).is_err());
        assert!(Topology::new(5).is_err());
        assert!(Topology::new(0).is_err());
    }

    #[test]
    fn index_helpers() {
        let topology = Topology::new(4).unwrap();

        assert_eq!(topology.edge_first_endpoint(0), 0);
        assert_eq!(topology.edge_first_endpoint(3), 6);
        assert_eq!(topology.aggregate_first_endpoint(0), 0);
        assert_eq!(topology.aggregate_first_endpoint(1), 0);
        assert_eq!(topology.aggregate_first_endpoint(2), 4);
        assert_eq!(topology.core_port_for(0), 0);
        assert_eq!(topology.core_port_for(5), 1);
        assert_eq!(topology.core_port_for(7), 1);
    }
}
