//! # Aggregate Switch Engine
//!
//! The intra-pod tier. An aggregate switch connects every edge switch of
//! its pod through its down-ports and one core switch group through its
//! up-ports.
//!
//! A reduce message can only arrive from below through the down-port in the
//! switch's own column. Combined with the edges' same-column send rule this
//! means each aggregate observes exactly one column's worth of endpoint
//! data from inside its pod, while every core above it reports the same
//! global partial for the remaining pods. The first up-port payload is
//! cached as a reference and later up-ports must match it exactly; a
//! mismatch means the collective state somewhere below is corrupt.

use tracing::trace;

use crate::error::SimError;
use crate::network::message::{Chunk, EndpointId, Message, ReduceOp};
use crate::network::port::{PortArena, PortId};
use crate::network::switch::{all_set, set_count, SwitchPorts};
use crate::topology::Topology;

/// Rooted-reduce state toward a destination inside the pod. Receive flags
/// cover the up-ports plus one extra slot for the same-column down-port.
#[derive(Debug)]
enum ReducePhase {
    Idle,
    Collecting {
        destination: EndpointId,
        op: ReduceOp,
        value: Vec<f32>,
        /// First payload seen on any up-port; later up-ports must be equal.
        reference: Option<Vec<f32>>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
enum ReduceAllPhase {
    Idle,
    CollectingToUp {
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
    CollectingToDown {
        op: ReduceOp,
        value: Option<Vec<f32>>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
enum AllGatherPhase {
    Idle,
    /// One slot per down-port, in pod order.
    CollectingToUp {
        slots: Vec<Option<Vec<Chunk>>>,
    },
    CollectingToDown {
        chunks: Option<Vec<Chunk>>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
pub(crate) struct AggregateSwitch {
    sw: SwitchPorts,
    label: String,
    topology: Topology,
    /// First endpoint id of this switch's pod.
    first_endpoint: EndpointId,
    /// Down-port index of the edge switch in the same column.
    same_column_down_port: usize,
    compute_enabled: bool,
    barrier_release_seen: Vec<bool>,
    reduce: ReducePhase,
    reduce_all: ReduceAllPhase,
    all_gather: AllGatherPhase,
}

impl AggregateSwitch {
    pub fn new(
        id: usize,
        topology: Topology,
        compute_enabled: bool,
        arena: &mut PortArena,
    ) -> Self {
        let sw = SwitchPorts::new(id, topology, arena);
        let up_count = sw.up_count();

        trace!("created aggregate switch {id}");

        Self {
            sw,
            label: format!("aggregate switch {id}"),
            topology,
            first_endpoint: topology.aggregate_first_endpoint(id),
            same_column_down_port: id % topology.pod_size(),
            compute_enabled,
            barrier_release_seen: vec![false; up_count],
            reduce: ReducePhase::Idle,
            reduce_all: ReduceAllPhase::Idle,
            all_gather: AllGatherPhase::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.sw.id()
    }

    pub fn up_port(&self, index: usize) -> PortId {
        self.sw.up_port(index)
    }

    pub fn down_port(&self, index: usize) -> PortId {
        self.sw.down_port(index)
    }

    pub fn verify_connected(&self, arena: &PortArena) -> Result<(), SimError> {
        self.sw.verify_connected(arena, "aggregate")
    }

    /// True when the endpoint sits behind one of this switch's down-ports.
    fn owns(&self, endpoint: EndpointId) -> bool {
        let served = self.sw.down_count() * self.topology.half_ports();
        endpoint >= self.first_endpoint && endpoint < self.first_endpoint + served
    }

    /// Down-port index serving the endpoint, if it is inside the pod.
    fn down_index_for(&self, endpoint: EndpointId) -> Option<usize> {
        if self.owns(endpoint) {
            Some((endpoint - self.first_endpoint) / self.topology.half_ports())
        } else {
            None
        }
    }

    fn down_port_for(&self, endpoint: EndpointId) -> Option<PortId> {
        self.down_index_for(endpoint)
            .map(|index| self.sw.down_port(index))
    }

    pub fn tick(&mut self, arena: &mut PortArena) -> Result<(), SimError> {
        self.sw.tick_ports(arena);

        for index in 0..self.sw.len() {
            let Some(message) = arena.pop_incoming(self.sw.port(index)) else {
                continue;
            };

            if !self.compute_enabled {
                self.route_by_destination(arena, message)?;
                continue;
            }

            match message {
                Message::Direct { destination, .. } | Message::Acknowledge { destination, .. } => {
                    self.route_unicast(arena, destination, message);
                }
                Message::Broadcast { source, data } => {
                    self.on_broadcast(arena, index, source, data);
                }
                Message::BarrierRequest { source } => {
                    self.on_barrier_request(arena, index, source)?;
                }
                Message::BarrierRelease => {
                    self.on_barrier_release(arena, index)?;
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
                Message::InterSwitchGather {
                    destination,
                    chunks,
                } => {
                    self.on_inter_gather(arena, index, destination, chunks)?;
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

    fn route_by_destination(
        &self,
        arena: &mut PortArena,
        message: Message,
    ) -> Result<(), SimError> {
        match message.destination() {
            Some(destination) => {
                self.route_unicast(arena, destination, message);
                Ok(())
            }
            None => Err(SimError::protocol(
                self.label.clone(),
                format!(
                    "cannot route {} without a destination while computing is disabled",
                    message.kind()
                ),
            )),
        }
    }

    fn route_unicast(&self, arena: &mut PortArena, destination: EndpointId, message: Message) {
        match self.down_port_for(destination) {
            Some(port) => arena.push_outgoing(port, message),
            None => arena.push_outgoing(self.sw.least_loaded_up_port(arena), message),
        }
    }

    fn on_broadcast(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
        data: Vec<f32>,
    ) {
        if self.sw.is_down(source_index) {
            for down in 0..self.sw.down_count() {
                let port = self.sw.down_port(down);
                if port == self.sw.port(source_index) {
                    continue;
                }
                arena.push_outgoing(
                    port,
                    Message::Broadcast {
                        source,
                        data: data.clone(),
                    },
                );
            }

            arena.push_outgoing(
                self.sw.least_loaded_up_port(arena),
                Message::Broadcast { source, data },
            );
        } else {
            for down in 0..self.sw.down_count() {
                arena.push_outgoing(
                    self.sw.down_port(down),
                    Message::Broadcast {
                        source,
                        data: data.clone(),
                    },
                );
            }
        }
    }

    fn on_barrier_request(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
    ) -> Result<(), SimError> {
        if !self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("barrier request from endpoint {source} arrived on an up-port"),
            ));
        }

        for up in 0..self.sw.up_count() {
            arena.push_outgoing(self.sw.up_port(up), Message::BarrierRequest { source });
        }

        Ok(())
    }

    fn on_barrier_release(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
    ) -> Result<(), SimError> {
        if self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                "barrier release arrived on a down-port",
            ));
        }

        self.barrier_release_seen[source_index] = true;

        if all_set(&self.barrier_release_seen) {
            for down in 0..self.sw.down_count() {
                arena.push_outgoing(self.sw.down_port(down), Message::BarrierRelease);
            }
            self.barrier_release_seen.fill(false);
        }

        Ok(())
    }

    /// Receive-flag slot for a reduce contribution: up-ports map to their
    /// own index, the same-column down-port to one slot past them.
    fn reduce_slot(&self, source_index: usize) -> Result<usize, SimError> {
        if !self.sw.is_down(source_index) {
            return Ok(source_index);
        }

        if self.sw.down_index(source_index) == Some(self.same_column_down_port) {
            Ok(self.sw.up_count())
        } else {
            Err(SimError::protocol(
                self.label.clone(),
                format!("reduce arrived on down-port outside the switch's column ({source_index})"),
            ))
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
        let slot = self.reduce_slot(source_index)?;
        let from_down = self.sw.is_down(source_index);

        let Some(destination_down_index) = self.down_index_for(destination) else {
            // The destination lives in another pod: every core must observe
            // this pod's column partial.
            if matches!(self.reduce, ReducePhase::Collecting { .. }) {
                return Err(SimError::protocol(
                    self.label.clone(),
                    "reduce toward a down-port is already in progress",
                ));
            }

            for up in 0..self.sw.up_count() {
                arena.push_outgoing(
                    self.sw.up_port(up),
                    Message::Reduce {
                        destination,
                        op,
                        data: data.clone(),
                    },
                );
            }

            return Ok(());
        };

        let destined_same_column = destination_down_index == self.same_column_down_port;

        if from_down && destined_same_column {
            return Err(SimError::protocol(
                self.label.clone(),
                "reduce destined to the same column arrived from that column's down-port",
            ));
        }

        match &mut self.reduce {
            ReducePhase::Idle => {
                let mut seen = vec![false; self.sw.up_count() + 1];
                seen[slot] = true;
                let reference = if from_down { None } else { Some(data.clone()) };
                self.reduce = ReducePhase::Collecting {
                    destination,
                    op,
                    value: data,
                    reference,
                    seen,
                };
                Ok(())
            }
            ReducePhase::Collecting {
                destination: expected,
                op: current,
                value,
                reference,
                seen,
            } => {
                if seen[slot] {
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

                // Down-port data always folds in. Up-port data folds in only
                // once: all cores deliver the same global partial, so later
                // copies are verified instead of re-applied.
                let first_up_payload = !from_down && reference.is_none();
                if from_down || first_up_payload {
                    current.fold_into(value, &data);
                }

                seen[slot] = true;

                if first_up_payload {
                    *reference = Some(data);
                } else if !from_down {
                    match reference {
                        Some(expected_data) if *expected_data == data => {}
                        _ => {
                            return Err(SimError::protocol(
                                self.label.clone(),
                                format!(
                                    "up-port {source_index} payload does not match the reference \
                                     value"
                                ),
                            ));
                        }
                    }
                }

                let expected_count = if destined_same_column {
                    // The destination edge never sends upward, so only the
                    // cores contribute.
                    self.sw.up_count()
                } else {
                    self.sw.up_count() + 1
                };

                if set_count(seen) == expected_count {
                    let message = Message::Reduce {
                        destination: *expected,
                        op: *current,
                        data: std::mem::take(value),
                    };
                    let port = self.sw.down_port(destination_down_index);
                    arena.push_outgoing(port, message);
                    self.reduce = ReducePhase::Idle;
                }

                Ok(())
            }
        }
    }

    fn on_reduce_all(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        if let Some(down_index) = self.sw.down_index(source_index) {
            match &mut self.reduce_all {
                ReduceAllPhase::CollectingToDown { .. } => Err(SimError::protocol(
                    self.label.clone(),
                    "reduce-all toward the down-ports is already in progress",
                )),
                ReduceAllPhase::Idle => {
                    let mut seen = vec![false; self.sw.down_count()];
                    seen[down_index] = true;
                    self.reduce_all = ReduceAllPhase::CollectingToUp {
                        op,
                        value: data,
                        seen,
                    };
                    Ok(())
                }
                ReduceAllPhase::CollectingToUp {
                    op: current,
                    value,
                    seen,
                } => {
                    if seen[down_index] {
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

                    seen[down_index] = true;
                    current.fold_into(value, &data);

                    if all_set(seen) {
                        for up in 0..self.sw.up_count() {
                            arena.push_outgoing(
                                self.sw.up_port(up),
                                Message::ReduceAll {
                                    op: *current,
                                    data: value.clone(),
                                },
                            );
                        }
                        self.reduce_all = ReduceAllPhase::CollectingToDown {
                            op,
                            value: None,
                            seen: vec![false; self.sw.up_count()],
                        };
                    }

                    Ok(())
                }
            }
        } else {
            match &mut self.reduce_all {
                ReduceAllPhase::CollectingToUp { .. } => Err(SimError::protocol(
                    self.label.clone(),
                    "reduce-all toward the up-ports is already in progress",
                )),
                ReduceAllPhase::Idle => Err(SimError::protocol(
                    self.label.clone(),
                    "downward reduce-all was not initiated",
                )),
                ReduceAllPhase::CollectingToDown {
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

                    match value {
                        None => *value = Some(data),
                        Some(expected) => {
                            if *expected != data {
                                return Err(SimError::protocol(
                                    self.label.clone(),
                                    format!(
                                        "reduce-all result from port {source_index} differs from \
                                         the copy received earlier"
                                    ),
                                ));
                            }
                        }
                    }

                    seen[source_index] = true;

                    if all_set(seen) {
                        if let Some(result) = value.take() {
                            for down in 0..self.sw.down_count() {
                                arena.push_outgoing(
                                    self.sw.down_port(down),
                                    Message::ReduceAll {
                                        op: *current,
                                        data: result.clone(),
                                    },
                                );
                            }
                        }
                        self.reduce_all = ReduceAllPhase::Idle;
                    }

                    Ok(())
                }
            }
        }
    }

    /// Slice a scatter bundle: entries destined to endpoints behind the
    /// given down-port, in their original order.
    fn split_chunks_for_down_port(&self, chunks: &mut Vec<Chunk>, down_index: usize) -> Vec<Chunk> {
        let half = self.topology.half_ports();
        let start = self.first_endpoint + down_index * half;
        let end = start + half;

        let mut taken = Vec::with_capacity(half);
        let mut rest = Vec::with_capacity(chunks.len().saturating_sub(half));
        for entry in chunks.drain(..) {
            if entry.0 >= start && entry.0 < end {
                taken.push(entry);
            } else {
                rest.push(entry);
            }
        }
        *chunks = rest;

        taken
    }

    fn on_inter_scatter(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
        mut chunks: Vec<Chunk>,
    ) -> Result<(), SimError> {
        if chunks.is_empty() {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch scatter payload is empty",
            ));
        }

        let half = self.topology.half_ports();

        if let Some(source_down_index) = self.sw.down_index(source_index) {
            // From the pod that hosts the root: serve the pod's other edges,
            // then hand the remainder to a core.
            for down in 0..self.sw.down_count() {
                if down == source_down_index {
                    continue;
                }

                let taken = self.split_chunks_for_down_port(&mut chunks, down);
                if taken.len() != half {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "scatter bundle holds {} chunks for down-port {down}, expected {half}",
                            taken.len()
                        ),
                    ));
                }

                trace!(
                    "aggregate switch {}: scatter bundle of {} chunks to down-port {down}",
                    self.sw.id(),
                    taken.len()
                );
                arena.push_outgoing(
                    self.sw.down_port(down),
                    Message::InterSwitchScatter {
                        source,
                        chunks: taken,
                    },
                );
            }

            if chunks.is_empty() {
                return Err(SimError::protocol(
                    self.label.clone(),
                    "scatter bundle has nothing left for the core tier",
                ));
            }

            arena.push_outgoing(
                self.sw.least_loaded_up_port(arena),
                Message::InterSwitchScatter { source, chunks },
            );
        } else {
            // From a core: the bundle covers exactly this pod.
            if chunks.len() != self.sw.down_count() * half {
                return Err(SimError::protocol(
                    self.label.clone(),
                    format!(
                        "scatter bundle from core holds {} chunks, expected {}",
                        chunks.len(),
                        self.sw.down_count() * half
                    ),
                ));
            }

            for down in 0..self.sw.down_count() {
                let taken = self.split_chunks_for_down_port(&mut chunks, down);
                if taken.len() != half {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "scatter bundle holds {} chunks for down-port {down}, expected {half}",
                            taken.len()
                        ),
                    ));
                }

                arena.push_outgoing(
                    self.sw.down_port(down),
                    Message::InterSwitchScatter {
                        source,
                        chunks: taken,
                    },
                );
            }
        }

        Ok(())
    }

    fn on_inter_gather(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        chunks: Vec<Chunk>,
    ) -> Result<(), SimError> {
        if chunks.is_empty() {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch gather payload is empty",
            ));
        }

        let message = Message::InterSwitchGather {
            destination,
            chunks,
        };

        if self.sw.is_down(source_index) {
            match self.down_port_for(destination) {
                Some(port) => {
                    if port == self.sw.port(source_index) {
                        return Err(SimError::protocol(
                            self.label.clone(),
                            "gather bundle is destined to its own source port",
                        ));
                    }
                    arena.push_outgoing(port, message);
                }
                None => {
                    arena.push_outgoing(self.sw.least_loaded_up_port(arena), message);
                }
            }
        } else {
            let Some(port) = self.down_port_for(destination) else {
                return Err(SimError::protocol(
                    self.label.clone(),
                    format!("gather bundle from core for foreign endpoint {destination}"),
                ));
            };
            arena.push_outgoing(port, message);
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

        if let Some(down_index) = self.sw.down_index(source_index) {
            match &mut self.all_gather {
                AllGatherPhase::CollectingToDown { .. } => Err(SimError::protocol(
                    self.label.clone(),
                    "all-gather toward the down-ports is already in progress",
                )),
                AllGatherPhase::Idle => {
                    let mut slots: Vec<Option<Vec<Chunk>>> = vec![None; self.sw.down_count()];
                    slots[down_index] = Some(incoming);
                    self.all_gather = AllGatherPhase::CollectingToUp { slots };
                    Ok(())
                }
                AllGatherPhase::CollectingToUp { slots } => {
                    if slots[down_index].is_some() {
                        return Err(SimError::protocol(
                            self.label.clone(),
                            format!("port {source_index} already contributed to this all-gather"),
                        ));
                    }

                    slots[down_index] = Some(incoming);

                    if slots.iter().all(Option::is_some) {
                        // Down-ports are ordered by endpoint block, so a
                        // plain concatenation stays sorted by endpoint id.
                        let mut combined = Vec::new();
                        for slot in slots.iter_mut() {
                            if let Some(chunks) = slot.take() {
                                combined.extend(chunks);
                            }
                        }

                        for up in 0..self.sw.up_count() {
                            arena.push_outgoing(
                                self.sw.up_port(up),
                                Message::InterSwitchAllGather {
                                    chunks: combined.clone(),
                                },
                            );
                        }

                        self.all_gather = AllGatherPhase::CollectingToDown {
                            chunks: None,
                            seen: vec![false; self.sw.up_count()],
                        };
                    }

                    Ok(())
                }
            }
        } else {
            match &mut self.all_gather {
                AllGatherPhase::CollectingToUp { .. } => Err(SimError::protocol(
                    self.label.clone(),
                    "all-gather toward the up-ports is already in progress",
                )),
                AllGatherPhase::Idle => Err(SimError::protocol(
                    self.label.clone(),
                    "downward all-gather was not initiated",
                )),
                AllGatherPhase::CollectingToDown { chunks, seen } => {
                    if seen[source_index] {
                        return Err(SimError::protocol(
                            self.label.clone(),
                            format!("port {source_index} already delivered the all-gather result"),
                        ));
                    }

                    match chunks {
                        None => *chunks = Some(incoming),
                        Some(expected) => {
                            if *expected != incoming {
                                return Err(SimError::protocol(
                                    self.label.clone(),
                                    format!(
                                        "all-gather result from port {source_index} differs from \
                                         the copy received earlier"
                                    ),
                                ));
                            }
                        }
                    }

                    seen[source_index] = true;

                    if all_set(seen) {
                        if let Some(result) = chunks.take() {
                            for down in 0..self.sw.down_count() {
                                arena.push_outgoing(
                                    self.sw.down_port(down),
                                    Message::InterSwitchAllGather {
                                        chunks: result.clone(),
                                    },
                                );
                            }
                        }
                        self.all_gather = AllGatherPhase::Idle;
                    }

                    Ok(())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregate_under_test(id: usize) -> (AggregateSwitch, PortArena) {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let aggregate = AggregateSwitch::new(id, topology, true, &mut arena);

        for index in 0..4 {
            let remote = arena.alloc();
            arena.connect(aggregate.sw.port(index), remote).unwrap();
        }

        (aggregate, arena)
    }

    #[test]
    fn pod_membership_follows_id() {
        // Aggregates 2 and 3 form pod 1 and serve endpoints 4..8.
        let (aggregate, _) = aggregate_under_test(2);

        assert!(!aggregate.owns(3));
        assert!(aggregate.owns(4));
        assert!(aggregate.owns(7));
        assert!(!aggregate.owns(8));
        assert_eq!(aggregate.down_index_for(4), Some(0));
        assert_eq!(aggregate.down_index_for(6), Some(1));
    }

    #[test]
    fn reduce_from_off_column_down_port_is_fatal() {
        let (mut aggregate, mut arena) = aggregate_under_test(2);

        // Aggregate 2 sits in column 0, so down-port 1 (absolute 3) must
        // never deliver a reduce contribution.
        let result = aggregate.on_reduce(&mut arena, 3, 0, ReduceOp::Sum, vec![1.0]);
        assert!(result.is_err());
    }

    #[test]
    fn remote_destination_replicates_to_all_up_ports() {
        let (mut aggregate, mut arena) = aggregate_under_test(2);

        // Destination 0 is another pod; the column partial goes to every core.
        aggregate
            .on_reduce(&mut arena, 2, 0, ReduceOp::Sum, vec![1.0])
            .unwrap();

        assert_eq!(arena.outgoing_len(aggregate.sw.up_port(0)), 1);
        assert_eq!(arena.outgoing_len(aggregate.sw.up_port(1)), 1);
    }

    #[test]
    fn up_port_reference_mismatch_is_fatal() {
        let (mut aggregate, mut arena) = aggregate_under_test(2);

        // Destination 6 is served by down-port 1, not column 0, so the
        // same-column down-port and both up-ports all contribute.
        aggregate
            .on_reduce(&mut arena, 0, 6, ReduceOp::Sum, vec![1.0])
            .unwrap();
        let result = aggregate.on_reduce(&mut arena, 1, 6, ReduceOp::Sum, vec![2.0]);
        assert!(result.is_err());
    }

    #[test]
    fn reduce_same_column_destination_completes_with_up_ports_only() {
        let (mut aggregate, mut arena) = aggregate_under_test(2);

        // Destination 4 sits behind down-port 0, the switch's own column.
        aggregate
            .on_reduce(&mut arena, 0, 4, ReduceOp::Sum, vec![5.0])
            .unwrap();
        aggregate
            .on_reduce(&mut arena, 1, 4, ReduceOp::Sum, vec![5.0])
            .unwrap();

        assert_eq!(arena.outgoing_len(aggregate.sw.down_port(0)), 1);
        assert!(matches!(aggregate.reduce, ReducePhase::Idle));
    }

    #[test]
    fn scatter_bundle_from_core_slices_by_edge() {
        let (mut aggregate, mut arena) = aggregate_under_test(2);

        let chunks: Vec<Chunk> = (4..8).map(|id| (id, vec![id as f32])).collect();
        aggregate
            .on_inter_scatter(&mut arena, 0, 0, chunks)
            .unwrap();

        assert_eq!(arena.outgoing_len(aggregate.sw.down_port(0)), 1);
        assert_eq!(arena.outgoing_len(aggregate.sw.down_port(1)), 1);
    }
}
