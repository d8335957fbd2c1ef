//! Shared switch plumbing.
//!
//! Every switch owns a fixed block of ports in the arena. By convention the
//! lower half of the indices are up-facing and the upper half down-facing.
//! The tier engines build on this module for port indexing, the
//! least-loaded up-port pick and the common receive-flag helpers.

use crate::error::SimError;
use crate::network::port::{PortArena, PortId};
use crate::topology::Topology;

/// Port block and identity shared by all switch tiers.
#[derive(Debug)]
pub(crate) struct SwitchPorts {
    id: usize,
    ports: Vec<PortId>,
    half: usize,
}

impl SwitchPorts {
    /// Allocate the switch's ports from the arena.
    pub fn new(id: usize, topology: Topology, arena: &mut PortArena) -> Self {
        let count = topology.ports_per_switch();
        let ports = (0..count).map(|_| arena.alloc()).collect();

        Self {
            id,
            ports,
            half: count / 2,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn up_count(&self) -> usize {
        self.half
    }

    pub fn down_count(&self) -> usize {
        self.half
    }

    /// Port by absolute index in `[0, k)`.
    pub fn port(&self, index: usize) -> PortId {
        self.ports[index]
    }

    /// Up-facing port by index in `[0, k/2)`.
    pub fn up_port(&self, index: usize) -> PortId {
        debug_assert!(index < self.half);
        self.ports[index]
    }

    /// Down-facing port by index in `[0, k/2)`.
    pub fn down_port(&self, index: usize) -> PortId {
        debug_assert!(index < self.half);
        self.ports[self.half + index]
    }

    /// True when the absolute index addresses a down-facing port.
    pub fn is_down(&self, index: usize) -> bool {
        index >= self.half
    }

    /// Down-port index of an absolute index, if it is down-facing.
    pub fn down_index(&self, index: usize) -> Option<usize> {
        index.checked_sub(self.half)
    }

    /// The up-port with the fewest queued outgoing messages. Ties break
    /// toward the lowest port index.
    pub fn least_loaded_up_port(&self, arena: &PortArena) -> PortId {
        let mut best = self.ports[0];
        let mut best_len = arena.outgoing_len(best);

        for &port in &self.ports[1..self.half] {
            let len = arena.outgoing_len(port);
            if len < best_len {
                best = port;
                best_len = len;
            }
        }

        best
    }

    /// Advance every owned port by one tick.
    pub fn tick_ports(&self, arena: &mut PortArena) {
        for &port in &self.ports {
            arena.tick(port);
        }
    }

    /// Verify that every port has a symmetric connection.
    pub fn verify_connected(&self, arena: &PortArena, tier: &str) -> Result<(), SimError> {
        for (index, &port) in self.ports.iter().enumerate() {
            if !arena.is_connected(port) {
                return Err(SimError::Wiring(format!(
                    "{tier} switch {}: port {index} is not connected",
                    self.id
                )));
            }
        }

        Ok(())
    }
}

/// True when every receive flag is set.
pub(crate) fn all_set(flags: &[bool]) -> bool {
    flags.iter().all(|&flag| flag)
}

/// Number of set receive flags.
pub(crate) fn set_count(flags: &[bool]) -> usize {
    flags.iter().filter(|&&flag| flag).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_layout_splits_in_halves() {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let sw = SwitchPorts::new(0, topology, &mut arena);

        assert_eq!(sw.len(), 4);
        assert_eq!(sw.up_count(), 2);
        assert_eq!(sw.up_port(0), sw.port(0));
        assert_eq!(sw.down_port(0), sw.port(2));
        assert!(!sw.is_down(1));
        assert!(sw.is_down(2));
        assert_eq!(sw.down_index(3), Some(1));
    }

    #[test]
    fn least_loaded_prefers_lowest_index_on_tie() {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let sw = SwitchPorts::new(0, topology, &mut arena);

        assert_eq!(sw.least_loaded_up_port(&arena), sw.up_port(0));

        arena.push_outgoing(
            sw.up_port(0),
            crate::network::message::Message::BarrierRelease,
        );
        assert_eq!(sw.least_loaded_up_port(&arena), sw.up_port(1));
    }
}
