//! # Fabric Construction and the Tick Loop
//!
//! [`Fabric::build`] creates every switch and endpoint of a k-ary fat-tree
//! and wires the three tiers together:
//!
//! - Aggregate switches form pods of `k/2`. The switch in column `c` of a
//!   pod connects its up-ports to the core group `[c·k/2, (c+1)·k/2)`, and
//!   every core reserves one port per pod.
//! - Inside a pod, aggregate down-ports fan out to every edge switch, with
//!   the aggregate's column selecting the edge up-port.
//! - Edge down-ports connect straight to the endpoints.
//!
//! [`Fabric::run`] then drives the whole network tick by tick in the fixed
//! tier order core, aggregate, edge, endpoint until every endpoint's task
//! reports done. The first protocol violation aborts the run, and a
//! configurable tick budget turns a stall into an error instead of an
//! endless loop.

use tracing::{debug, info, trace};

use crate::error::SimError;
use crate::network::aggregate::AggregateSwitch;
use crate::network::core::CoreSwitch;
use crate::network::edge::EdgeSwitch;
use crate::network::endpoint::{Endpoint, EndpointTask};
use crate::network::message::EndpointId;
use crate::network::mpi::MpiStats;
use crate::network::port::PortArena;
use crate::topology::Topology;

pub struct Fabric {
    topology: Topology,
    arena: PortArena,
    cores: Vec<CoreSwitch>,
    aggregates: Vec<AggregateSwitch>,
    edges: Vec<EdgeSwitch>,
    endpoints: Vec<Endpoint>,
}

impl Fabric {
    /// Build and wire the complete network. `task_for` supplies the user
    /// task of each endpoint.
    pub fn build<F>(
        topology: Topology,
        compute_enabled: bool,
        mut task_for: F,
    ) -> Result<Self, SimError>
    where
        F: FnMut(EndpointId) -> EndpointTask,
    {
        let mut arena = PortArena::new();

        let cores: Vec<CoreSwitch> = (0..topology.core_switches())
            .map(|id| CoreSwitch::new(id, topology, compute_enabled, &mut arena))
            .collect();
        debug!("generated {} core switches", cores.len());

        let aggregates: Vec<AggregateSwitch> = (0..topology.aggregate_switches())
            .map(|id| AggregateSwitch::new(id, topology, compute_enabled, &mut arena))
            .collect();
        debug!("generated {} aggregate switches", aggregates.len());

        let edges: Vec<EdgeSwitch> = (0..topology.edge_switches())
            .map(|id| EdgeSwitch::new(id, topology, compute_enabled, &mut arena))
            .collect();
        debug!("generated {} edge switches", edges.len());

        let mut endpoints = Vec::with_capacity(topology.endpoints());
        for id in 0..topology.endpoints() {
            endpoints.push(Endpoint::new(
                id,
                topology,
                compute_enabled,
                &mut arena,
                task_for(id),
            ));
        }
        debug!("generated {} endpoints", endpoints.len());

        let half = topology.half_ports();
        let pod_size = topology.pod_size();

        // Core to aggregate. An aggregate in pod column c reaches the
        // cores [c * k/2, (c + 1) * k/2), each on the port matching the
        // aggregate's pod.
        for (aggregate_id, aggregate) in aggregates.iter().enumerate() {
            let first_core = (aggregate_id % pod_size) * half;
            let core_port = aggregate_id / pod_size;

            for up in 0..half {
                let core = &cores[first_core + up];
                arena.connect(aggregate.up_port(up), core.port(core_port))?;
                trace!(
                    "connected core switch {} with aggregate switch {aggregate_id}",
                    core.id()
                );
            }
        }

        // Aggregate to edge, within each pod.
        for (aggregate_id, aggregate) in aggregates.iter().enumerate() {
            let edge_up_port = aggregate_id % pod_size;
            let first_edge = aggregate_id - edge_up_port;

            for down in 0..pod_size {
                let edge = &edges[first_edge + down];
                arena.connect(aggregate.down_port(down), edge.up_port(edge_up_port))?;
                trace!(
                    "connected edge switch {} with aggregate switch {}",
                    edge.id(),
                    aggregate.id()
                );
            }
        }

        // Edge to endpoint.
        for (edge_id, edge) in edges.iter().enumerate() {
            for down in 0..half {
                let endpoint = &endpoints[edge_id * half + down];
                arena.connect(edge.down_port(down), endpoint.port())?;
                trace!(
                    "connected edge switch {edge_id} with endpoint {}",
                    endpoint.id()
                );
            }
        }

        // Every port of every component must have found a peer.
        for core in &cores {
            core.verify_connected(&arena)?;
        }
        for aggregate in &aggregates {
            aggregate.verify_connected(&arena)?;
        }
        for edge in &edges {
            edge.verify_connected(&arena)?;
        }
        for endpoint in &endpoints {
            if !endpoint.is_ready(&arena) {
                return Err(SimError::Wiring(format!(
                    "endpoint {} is not connected",
                    endpoint.id()
                )));
            }
        }

        info!("network established successfully");

        Ok(Self {
            topology,
            arena,
            cores,
            aggregates,
            edges,
            endpoints,
        })
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Advance the whole network by one tick, tier by tier.
    pub fn tick(&mut self) -> Result<(), SimError> {
        for core in &mut self.cores {
            core.tick(&mut self.arena)?;
        }
        for aggregate in &mut self.aggregates {
            aggregate.tick(&mut self.arena)?;
        }
        for edge in &mut self.edges {
            edge.tick(&mut self.arena)?;
        }
        for endpoint in &mut self.endpoints {
            endpoint.tick(&mut self.arena)?;
        }

        Ok(())
    }

    /// Run until every endpoint's task is done. Returns the tick count.
    pub fn run(&mut self, max_ticks: u64) -> Result<u64, SimError> {
        let mut ticks = 0;

        loop {
            ticks += 1;
            trace!("tick {ticks}");

            self.tick()?;

            if self.endpoints.iter().all(Endpoint::is_done) {
                info!("all endpoints finished their tasks after {ticks} ticks");
                break;
            }

            if ticks >= max_ticks {
                return Err(SimError::Stalled(max_ticks));
            }
        }

        for endpoint in &mut self.endpoints {
            endpoint.join();
        }

        if let Some(endpoint) = self.endpoints.iter().find(|endpoint| endpoint.has_failed()) {
            return Err(SimError::mpi(endpoint.id(), "endpoint task failed"));
        }

        Ok(ticks)
    }

    /// Message totals per endpoint, in id order.
    pub fn endpoint_stats(&self) -> Vec<MpiStats> {
        self.endpoints
            .iter()
            .map(|endpoint| endpoint.mpi().stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_task(_id: EndpointId) -> EndpointTask {
        Box::new(|_mpi| Ok(()))
    }

    #[test]
    fn build_wires_every_port() {
        let topology = Topology::new(4).unwrap();
        let fabric = Fabric::build(topology, true, idle_task).unwrap();

        assert_eq!(fabric.cores.len(), 4);
        assert_eq!(fabric.aggregates.len(), 8);
        assert_eq!(fabric.edges.len(), 8);
        assert_eq!(fabric.endpoints.len(), 16);
    }

    #[test]
    fn build_wires_k6() {
        let topology = Topology::new(6).unwrap();
        let fabric = Fabric::build(topology, true, idle_task).unwrap();

        assert_eq!(fabric.cores.len(), 9);
        assert_eq!(fabric.aggregates.len(), 18);
        assert_eq!(fabric.endpoints.len(), 54);
    }

    #[test]
    fn idle_tasks_finish_immediately() {
        let topology = Topology::new(4).unwrap();
        let mut fabric = Fabric::build(topology, true, idle_task).unwrap();

        let ticks = fabric.run(1_000).unwrap();
        assert!(ticks < 1_000);
    }

    #[test]
    fn failing_task_surfaces_as_error() {
        let topology = Topology::new(4).unwrap();
        let mut fabric = Fabric::build(topology, true, |id| {
            Box::new(move |_mpi| {
                if id == 3 {
                    Err(SimError::mpi(id, "deliberate failure"))
                } else {
                    Ok(())
                }
            })
        })
        .unwrap();

        assert!(fabric.run(1_000).is_err());
    }
}
