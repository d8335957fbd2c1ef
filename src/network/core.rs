//! # Core Switch Engine
//!
//! The inter-pod tier. Every core switch port faces one pod, and the block
//! of `(k/2)²` endpoint ids behind a port follows directly from the port
//! index, so unicast routing is a division.
//!
//! The core finishes the last collecting stage of reduce, reduce-all and
//! all-gather, collects barrier entries from every endpoint in the network,
//! and splits scatter bundles into one per-pod bundle for each port.

use tracing::{trace, warn};

use crate::error::SimError;
use crate::network::message::{Chunk, EndpointId, Message, ReduceOp};
use crate::network::port::{PortArena, PortId};
use crate::network::switch::{all_set, set_count, SwitchPorts};
use crate::topology::Topology;

#[derive(Debug)]
enum ReducePhase {
    Idle,
    Collecting {
        destination: EndpointId,
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
enum ReduceAllPhase {
    Idle,
    Collecting {
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
enum AllGatherPhase {
    Idle,
    /// One slot per port; concatenating in port order keeps the result
    /// sorted by endpoint id.
    Collecting {
        slots: Vec<Option<Vec<Chunk>>>,
    },
}

#[derive(Debug)]
pub(crate) struct CoreSwitch {
    sw: SwitchPorts,
    label: String,
    endpoints_per_port: usize,
    compute_enabled: bool,
    /// One flag per endpoint in the network.
    barrier_requested: Vec<bool>,
    reduce: ReducePhase,
    reduce_all: ReduceAllPhase,
    all_gather: AllGatherPhase,
}

impl CoreSwitch {
    pub fn new(
        id: usize,
        topology: Topology,
        compute_enabled: bool,
        arena: &mut PortArena,
    ) -> Self {
        let sw = SwitchPorts::new(id, topology, arena);

        trace!("created core switch {id}");

        Self {
            sw,
            label: format!("core switch {id}"),
            endpoints_per_port: topology.endpoints_per_core_port(),
            compute_enabled,
            barrier_requested: vec![false; topology.endpoints()],
            reduce: ReducePhase::Idle,
            reduce_all: ReduceAllPhase::Idle,
            all_gather: AllGatherPhase::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.sw.id()
    }

    pub fn port(&self, index: usize) -> PortId {
        self.sw.port(index)
    }

    pub fn verify_connected(&self, arena: &PortArena) -> Result<(), SimError> {
        self.sw.verify_connected(arena, "core")
    }

    fn port_for(&self, endpoint: EndpointId) -> usize {
        endpoint / self.endpoints_per_port
    }

    pub fn tick(&mut self, arena: &mut PortArena) -> Result<(), SimError> {
        self.sw.tick_ports(arena);

        for index in 0..self.sw.len() {
            let Some(message) = arena.pop_incoming(self.sw.port(index)) else {
                continue;
            };

            trace!(
                "core switch {}: received {} on port {index}",
                self.sw.id(),
                message.kind()
            );

            if !self.compute_enabled {
                self.redirect(arena, index, message)?;
                continue;
            }

            match message {
                Message::Direct { .. } | Message::Acknowledge { .. } => {
                    self.redirect(arena, index, message)?;
                }
                Message::Broadcast { source, data } => {
                    self.on_broadcast(arena, index, source, data);
                }
                Message::BarrierRequest { source } => {
                    self.on_barrier_request(arena, source);
                }
                Message::Reduce {
                    destination,
                    op,
                    data,
                } => {
                    self.on_reduce(arena, index, destination, op, data)?;
                }
                Message::ReduceAll { op, data } => {
                    self.on_reduce_all(arena, index, op, data)?;
                }
                Message::InterSwitchScatter { source, chunks } => {
                    self.on_inter_scatter(arena, index, source, chunks)?;
                }
                Message::InterSwitchGather { .. } => {
                    self.redirect(arena, index, message)?;
                }
                Message::InterSwitchAllGather { chunks } => {
                    self.on_inter_all_gather(arena, index, chunks)?;
                }
                other => {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("cannot process a {} message at this tier", other.kind()),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Route a message by its destination id. The source and target port
    /// must differ; a loop here means routing went wrong a tier below.
    fn redirect(
        &self,
        arena: &mut PortArena,
        source_index: usize,
        message: Message,
    ) -> Result<(), SimError> {
        let Some(destination) = message.destination() else {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("{} carries no destination to route by", message.kind()),
            ));
        };

        let target = self.port_for(destination);
        if target == source_index {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("target and source port are the same ({source_index})"),
            ));
        }

        arena.push_outgoing(self.sw.port(target), message);
        Ok(())
    }

    fn on_broadcast(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
        data: Vec<f32>,
    ) {
        for index in 0..self.sw.len() {
            if index == source_index {
                continue;
            }
            arena.push_outgoing(
                self.sw.port(index),
                Message::Broadcast {
                    source,
                    data: data.clone(),
                },
            );
        }
    }

    fn on_barrier_request(&mut self, arena: &mut PortArena, source: EndpointId) {
        if self.barrier_requested[source] {
            warn!(
                "core switch {}: endpoint {source} already sent a barrier request",
                self.sw.id()
            );
        } else {
            self.barrier_requested[source] = true;
        }

        if all_set(&self.barrier_requested) {
            trace!(
                "core switch {}: all endpoints entered the barrier, releasing",
                self.sw.id()
            );

            for index in 0..self.sw.len() {
                arena.push_outgoing(self.sw.port(index), Message::BarrierRelease);
            }
            self.barrier_requested.fill(false);
        }
    }

    fn on_reduce(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        let destination_port = self.port_for(destination);
        if destination_port == source_index {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("reduce contribution arrived on the destination's port {source_index}"),
            ));
        }

        match &mut self.reduce {
            ReducePhase::Idle => {
                let mut seen = vec![false; self.sw.len()];
                seen[source_index] = true;
                self.reduce = ReducePhase::Collecting {
                    destination,
                    op,
                    value: data,
                    seen,
                };
            }
            ReducePhase::Collecting {
                destination: expected,
                op: current,
                value,
                seen,
            } => {
                if seen[source_index] {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("port {source_index} already contributed to this reduce"),
                    ));
                }
                if *expected != destination {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("reduce destination {destination} differs from expected {expected}"),
                    ));
                }
                if *current != op {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("reduce operation {op} differs from expected {current}"),
                    ));
                }
                if value.len() != data.len() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "reduce payload length {} differs from expected {}",
                            data.len(),
                            value.len()
                        ),
                    ));
                }

                seen[source_index] = true;
                current.fold_into(value, &data);
            }
        }

        // One contribution arrives per port except the destination's own.
        if let ReducePhase::Collecting {
            destination,
            op,
            value,
            seen,
        } = &mut self.reduce
        {
            if set_count(seen) == self.sw.len() - 1 {
                let target = *destination / self.endpoints_per_port;
                if seen[target] {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("target port {target} also appears as a reduce source"),
                    ));
                }

                let message = Message::Reduce {
                    destination: *destination,
                    op: *op,
                    data: std::mem::take(value),
                };
                arena.push_outgoing(self.sw.port(target), message);
                self.reduce = ReducePhase::Idle;
            }
        }

        Ok(())
    }

    fn on_reduce_all(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        match &mut self.reduce_all {
            ReduceAllPhase::Idle => {
                let mut seen = vec![false; self.sw.len()];
                seen[source_index] = true;
                self.reduce_all = ReduceAllPhase::Collecting {
                    op,
                    value: data,
                    seen,
                };
                Ok(())
            }
            ReduceAllPhase::Collecting {
                op: current,
                value,
                seen,
            } => {
                if seen[source_index] {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("port {source_index} already contributed to this reduce-all"),
                    ));
                }
                if *current != op {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("reduce-all operation {op} differs from expected {current}"),
                    ));
                }
                if value.len() != data.len() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "reduce-all payload length {} differs from expected {}",
                            data.len(),
                            value.len()
                        ),
                    ));
                }

                seen[source_index] = true;
                current.fold_into(value, &data);

                if all_set(seen) {
                    for index in 0..self.sw.len() {
                        arena.push_outgoing(
                            self.sw.port(index),
                            Message::ReduceAll {
                                op: *current,
                                data: value.clone(),
                            },
                        );
                    }
                    self.reduce_all = ReduceAllPhase::Idle;
                }

                Ok(())
            }
        }
    }

    fn on_inter_scatter(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
        mut chunks: Vec<Chunk>,
    ) -> Result<(), SimError> {
        let expected = self.endpoints_per_port * (self.sw.len() - 1);
        if chunks.len() != expected {
            return Err(SimError::protocol(
                self.label.clone(),
                format!(
                    "scatter bundle holds {} chunks, expected {expected}",
                    chunks.len()
                ),
            ));
        }

        for target in 0..self.sw.len() {
            if target == source_index {
                continue;
            }

            let first = target * self.endpoints_per_port;
            let mut bundle = Vec::with_capacity(self.endpoints_per_port);
            for endpoint in first..first + self.endpoints_per_port {
                let Some(position) = chunks.iter().position(|(id, _)| *id == endpoint) else {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("endpoint {endpoint} is missing from the scatter bundle"),
                    ));
                };
                bundle.push(chunks.swap_remove(position));
            }

            arena.push_outgoing(
                self.sw.port(target),
                Message::InterSwitchScatter {
                    source,
                    chunks: bundle,
                },
            );
        }

        Ok(())
    }

    fn on_inter_all_gather(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        incoming: Vec<Chunk>,
    ) -> Result<(), SimError> {
        if incoming.is_empty() {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch all-gather payload is empty",
            ));
        }

        match &mut self.all_gather {
            AllGatherPhase::Idle => {
                let mut slots: Vec<Option<Vec<Chunk>>> = vec![None; self.sw.len()];
                slots[source_index] = Some(incoming);
                self.all_gather = AllGatherPhase::Collecting { slots };
                Ok(())
            }
            AllGatherPhase::Collecting { slots } => {
                if slots[source_index].is_some() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("port {source_index} already contributed to this all-gather"),
                    ));
                }

                slots[source_index] = Some(incoming);

                if slots.iter().all(Option::is_some) {
                    let mut combined = Vec::new();
                    for slot in slots.iter_mut() {
                        if let Some(chunks) = slot.take() {
                            combined.extend(chunks);
                        }
                    }

                    trace!(
                        "core switch {}: all-gather complete, distributing {} chunks",
                        self.sw.id(),
                        combined.len()
                    );

                    for index in 0..self.sw.len() {
                        arena.push_outgoing(
                            self.sw.port(index),
                            Message::InterSwitchAllGather {
                                chunks: combined.clone(),
                            },
                        );
                    }

                    self.all_gather = AllGatherPhase::Idle;
                }

                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_under_test() -> (CoreSwitch, PortArena) {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let core = CoreSwitch::new(0, topology, true, &mut arena);

        for index in 0..4 {
            let remote = arena.alloc();
            arena.connect(core.sw.port(index), remote).unwrap();
        }

        (core, arena)
    }

    #[test]
    fn redirect_splits_by_endpoint_block() {
        let (core, mut arena) = core_under_test();

        core.redirect(
            &mut arena,
            0,
            Message::Direct {
                source: 0,
                destination: 9,
                data: vec![1.0],
            },
        )
        .unwrap();

        // Endpoint 9 sits behind port 2 with k=4.
        assert_eq!(arena.outgoing_len(core.sw.port(2)), 1);
    }

    #[test]
    fn redirect_to_source_port_is_fatal() {
        let (core, mut arena) = core_under_test();

        let result = core.redirect(
            &mut arena,
            0,
            Message::Direct {
                source: 1,
                destination: 2,
                data: vec![1.0],
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn barrier_releases_once_every_endpoint_entered() {
        let (mut core, mut arena) = core_under_test();

        for endpoint in 0..16 {
            core.on_barrier_request(&mut arena, endpoint);
        }

        for index in 0..4 {
            assert_eq!(arena.outgoing_len(core.sw.port(index)), 1);
        }
        assert!(!core.barrier_requested.iter().any(|&flag| flag));
    }

    #[test]
    fn reduce_completes_without_destination_port() {
        let (mut core, mut arena) = core_under_test();

        // Destination 0 lives behind port 0; ports 1..4 contribute.
        for port in 1..4 {
            core.on_reduce(&mut arena, port, 0, ReduceOp::Sum, vec![1.0])
                .unwrap();
        }

        assert_eq!(arena.outgoing_len(core.sw.port(0)), 1);
        assert!(matches!(core.reduce, ReducePhase::Idle));
    }

    #[test]
    fn scatter_bundle_is_split_per_port() {
        let (mut core, mut arena) = core_under_test();

        // A bundle arriving on port 3 covers the endpoints of ports 0..3.
        let chunks: Vec<Chunk> = (0..12).map(|id| (id, vec![id as f32])).collect();
        core.on_inter_scatter(&mut arena, 3, 12, chunks).unwrap();

        for port in 0..3 {
            assert_eq!(arena.outgoing_len(core.sw.port(port)), 1);
        }
        assert_eq!(arena.outgoing_len(core.sw.port(3)), 0);
    }
}
