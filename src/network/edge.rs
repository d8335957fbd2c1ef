//! # Edge Switch Engine
//!
//! The endpoint-facing tier. An edge switch serves a contiguous block of
//! `k/2` endpoint ids through its down-ports and reaches the rest of the
//! network through its up-ports, one per aggregate switch of its pod.
//!
//! Besides unicast routing the edge hosts the endpoint side of every
//! collective: it fans scatter slices out to its local endpoints, collects
//! gather contributions into per-endpoint slots, folds reduce and
//! reduce-all contributions before anything leaves the rack, and packs
//! all-gather chunks into the inter-switch bundles the upper tiers work
//! with.
//!
//! Reduce contributions that leave the switch always exit through the
//! up-port in the switch's own column. Each aggregate column thereby
//! carries exactly one column's worth of endpoint data, which is what lets
//! the aggregate tier combine pod data without double counting.

use tracing::trace;

use crate::error::SimError;
use crate::network::message::{Chunk, EndpointId, Message, ReduceOp};
use crate::network::port::{PortArena, PortId};
use crate::network::switch::{all_set, set_count, SwitchPorts};
use crate::topology::Topology;

/// Rooted-reduce engine state. The two collecting phases are mutually
/// exclusive by construction.
#[derive(Debug)]
enum ReducePhase {
    Idle,
    /// Folding local contributions for a destination served elsewhere.
    /// Flags are indexed by down-port.
    CollectingToUp {
        destination: EndpointId,
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
    /// Folding contributions for a local destination. Flags are indexed by
    /// absolute port; every port except the destination's own contributes.
    CollectingToDown {
        destination: EndpointId,
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
}

/// Unrooted-reduce engine state.
#[derive(Debug)]
enum ReduceAllPhase {
    Idle,
    /// Folding contributions from the local endpoints.
    CollectingToUp {
        op: ReduceOp,
        value: Vec<f32>,
        seen: Vec<bool>,
    },
    /// Waiting for the identical result copy from every up-port.
    CollectingToDown {
        op: ReduceOp,
        value: Option<Vec<f32>>,
        seen: Vec<bool>,
    },
}

/// Rooted-collection engine state.
#[derive(Debug)]
enum GatherPhase {
    Idle,
    /// One slot per local endpoint, ordered by endpoint id.
    CollectingToUp {
        destination: EndpointId,
        chunk_len: usize,
        slots: Vec<Option<Vec<f32>>>,
    },
    /// One slot per endpoint in the whole network; the destination's own
    /// slot stays empty.
    CollectingToDown {
        destination: EndpointId,
        chunk_len: usize,
        slots: Vec<Option<Vec<f32>>>,
    },
}

/// Unrooted-collection engine state.
#[derive(Debug)]
enum AllGatherPhase {
    Idle,
    CollectingToUp {
        chunk_len: usize,
        slots: Vec<Option<Vec<f32>>>,
    },
    CollectingToDown {
        chunks: Option<Vec<Chunk>>,
        seen: Vec<bool>,
    },
}

#[derive(Debug)]
pub(crate) struct EdgeSwitch {
    sw: SwitchPorts,
    label: String,
    topology: Topology,
    first_endpoint: EndpointId,
    /// Up-port index of the aggregate in the same column as this switch.
    same_column_up_port: usize,
    compute_enabled: bool,
    barrier_release_seen: Vec<bool>,
    reduce: ReducePhase,
    reduce_all: ReduceAllPhase,
    gather: GatherPhase,
    all_gather: AllGatherPhase,
}

impl EdgeSwitch {
    pub fn new(
        id: usize,
        topology: Topology,
        compute_enabled: bool,
        arena: &mut PortArena,
    ) -> Self {
        let sw = SwitchPorts::new(id, topology, arena);
        let up_count = sw.up_count();

        trace!("created edge switch {id}");

        Self {
            sw,
            label: format!("edge switch {id}"),
            topology,
            first_endpoint: topology.edge_first_endpoint(id),
            same_column_up_port: id % topology.pod_size(),
            compute_enabled,
            barrier_release_seen: vec![false; up_count],
            reduce: ReducePhase::Idle,
            reduce_all: ReduceAllPhase::Idle,
            gather: GatherPhase::Idle,
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
        self.sw.verify_connected(arena, "edge")
    }

    /// True when the endpoint is served by one of this switch's down-ports.
    fn owns(&self, endpoint: EndpointId) -> bool {
        endpoint >= self.first_endpoint && endpoint < self.first_endpoint + self.sw.down_count()
    }

    fn down_port_for(&self, endpoint: EndpointId) -> Option<PortId> {
        if self.owns(endpoint) {
            Some(self.sw.down_port(endpoint - self.first_endpoint))
        } else {
            None
        }
    }

    /// Advance all ports, then drain at most one ready message per port.
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
                Message::Scatter { source, data } => {
                    self.on_scatter(arena, index, source, data)?;
                }
                Message::Gather { destination, data } => {
                    self.on_gather(arena, index, destination, data)?;
                }
                Message::AllGather { data } => {
                    self.on_all_gather(arena, index, data)?;
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
            }
        }

        Ok(())
    }

    /// Pure routing used when in-network computing is disabled.
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
            // Copies to the other local endpoints, the original upward.
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

    fn on_reduce(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        if self.owns(destination) {
            self.reduce_toward_down(arena, source_index, destination, op, data)
        } else {
            self.reduce_toward_up(arena, source_index, destination, op, data)
        }
    }

    fn reduce_toward_up(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        let Some(down_index) = self.sw.down_index(source_index) else {
            return Err(SimError::protocol(
                self.label.clone(),
                "reduce destined upward arrived on an up-port",
            ));
        };

        match &mut self.reduce {
            ReducePhase::CollectingToDown { .. } => Err(SimError::protocol(
                self.label.clone(),
                "reduce toward a down-port is already in progress",
            )),
            ReducePhase::Idle => {
                let mut seen = vec![false; self.sw.down_count()];
                seen[down_index] = true;
                self.reduce = ReducePhase::CollectingToUp {
                    destination,
                    op,
                    value: data,
                    seen,
                };
                Ok(())
            }
            ReducePhase::CollectingToUp {
                destination: expected,
                op: current,
                value,
                seen,
            } => {
                if seen[down_index] {
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

                seen[down_index] = true;
                current.fold_into(value, &data);

                if all_set(seen) {
                    let message = Message::Reduce {
                        destination: *expected,
                        op: *current,
                        data: std::mem::take(value),
                    };
                    arena.push_outgoing(self.sw.up_port(self.same_column_up_port), message);
                    self.reduce = ReducePhase::Idle;
                }

                Ok(())
            }
        }
    }

    fn reduce_toward_down(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        op: ReduceOp,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        let destination_port_index = self.sw.up_count() + (destination - self.first_endpoint);

        if source_index == destination_port_index {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("reduce for endpoint {destination} arrived on the destination's own port"),
            ));
        }

        match &mut self.reduce {
            ReducePhase::CollectingToUp { .. } => Err(SimError::protocol(
                self.label.clone(),
                "reduce toward an up-port is already in progress",
            )),
            ReducePhase::Idle => {
                let mut seen = vec![false; self.sw.len()];
                seen[source_index] = true;
                self.reduce = ReducePhase::CollectingToDown {
                    destination,
                    op,
                    value: data,
                    seen,
                };
                Ok(())
            }
            ReducePhase::CollectingToDown {
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

                // Every port except the destination's own contributes.
                if set_count(seen) == self.sw.len() - 1 {
                    let message = Message::Reduce {
                        destination: *expected,
                        op: *current,
                        data: std::mem::take(value),
                    };
                    let port = self.sw.down_port(*expected - self.first_endpoint);
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
                        // The downward phase starts as soon as the fold
                        // leaves the switch.
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

    fn on_scatter(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        source: EndpointId,
        mut data: Vec<f32>,
    ) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::protocol(self.label.clone(), "scatter payload is empty"));
        }
        if !self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                "scatter arrived on an up-port",
            ));
        }
        if self.down_port_for(source) != Some(self.sw.port(source_index)) {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("scatter source {source} does not match source port {source_index}"),
            ));
        }

        let endpoints = self.topology.endpoints();
        let remaining = endpoints - 1;
        if data.len() % remaining != 0 {
            return Err(SimError::protocol(
                self.label.clone(),
                format!(
                    "scatter payload length {} is not divisible by {remaining}",
                    data.len()
                ),
            ));
        }
        let chunk_len = data.len() / remaining;
        let down_count = self.sw.down_count();

        // The root already kept its own slice, so the payload holds one
        // chunk per remaining endpoint, in ascending id order. The local
        // block therefore sits at a known offset.
        let local_start = self.first_endpoint * chunk_len;
        let mut offset = local_start;
        for down in 0..down_count {
            let port = self.sw.down_port(down);
            if port == self.sw.port(source_index) {
                continue;
            }

            trace!(
                "edge switch {}: scatter slice [{offset}, {}) to down-port {down}",
                self.sw.id(),
                offset + chunk_len
            );
            arena.push_outgoing(
                port,
                Message::Scatter {
                    source,
                    data: data[offset..offset + chunk_len].to_vec(),
                },
            );
            offset += chunk_len;
        }

        data.drain(local_start..local_start + chunk_len * (down_count - 1));

        // Bundle the rest for the upper tiers, with explicit destinations.
        let remote = endpoints - down_count;
        let mut chunks = Vec::with_capacity(remote);
        for index in 0..remote {
            let destination = if index < self.first_endpoint {
                index
            } else {
                index + down_count
            };
            chunks.push((
                destination,
                data[index * chunk_len..(index + 1) * chunk_len].to_vec(),
            ));
        }

        arena.push_outgoing(
            self.sw.least_loaded_up_port(arena),
            Message::InterSwitchScatter { source, chunks },
        );

        Ok(())
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
        if self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch scatter arrived on a down-port",
            ));
        }
        if chunks.len() != self.sw.down_count() {
            return Err(SimError::protocol(
                self.label.clone(),
                format!(
                    "inter-switch scatter carries {} chunks, expected {}",
                    chunks.len(),
                    self.sw.down_count()
                ),
            ));
        }

        let reference_len = chunks[0].1.len();

        // The bundle must cover the local endpoint range exactly once.
        for endpoint in self.first_endpoint..self.first_endpoint + self.sw.down_count() {
            let Some(position) = chunks.iter().position(|(id, _)| *id == endpoint) else {
                return Err(SimError::protocol(
                    self.label.clone(),
                    format!("inter-switch scatter misses endpoint {endpoint}"),
                ));
            };
            if chunks
                .iter()
                .skip(position + 1)
                .any(|(id, _)| *id == endpoint)
            {
                return Err(SimError::protocol(
                    self.label.clone(),
                    format!("inter-switch scatter repeats endpoint {endpoint}"),
                ));
            }

            let (_, data) = chunks.swap_remove(position);

            if data.len() != reference_len {
                return Err(SimError::protocol(
                    self.label.clone(),
                    format!(
                        "scatter chunk for endpoint {endpoint} has length {}, expected \
                         {reference_len}",
                        data.len()
                    ),
                ));
            }

            arena.push_outgoing(
                self.sw.down_port(endpoint - self.first_endpoint),
                Message::Scatter { source, data },
            );
        }

        Ok(())
    }

    fn on_gather(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        destination: EndpointId,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::protocol(self.label.clone(), "gather payload is empty"));
        }
        let Some(down_index) = self.sw.down_index(source_index) else {
            return Err(SimError::protocol(
                self.label.clone(),
                "gather arrived on an up-port",
            ));
        };
        let contributor = self.first_endpoint + down_index;

        if self.owns(destination) {
            if self.gather_accumulate(contributor, destination, data)? {
                self.emit_gather(arena)?;
            }
            return Ok(());
        }

        match &mut self.gather {
            GatherPhase::CollectingToDown { .. } => Err(SimError::protocol(
                self.label.clone(),
                "gather toward a down-port is already in progress",
            )),
            GatherPhase::Idle => {
                let mut slots: Vec<Option<Vec<f32>>> = vec![None; self.sw.down_count()];
                let chunk_len = data.len();
                slots[down_index] = Some(data);
                self.gather = GatherPhase::CollectingToUp {
                    destination,
                    chunk_len,
                    slots,
                };
                Ok(())
            }
            GatherPhase::CollectingToUp {
                destination: expected,
                chunk_len,
                slots,
            } => {
                if *expected != destination {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("gather destination {destination} differs from expected {expected}"),
                    ));
                }
                if *chunk_len != data.len() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "gather chunk length {} differs from expected {chunk_len}",
                            data.len()
                        ),
                    ));
                }
                if slots[down_index].is_some() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("port {source_index} already contributed to this gather"),
                    ));
                }

                slots[down_index] = Some(data);

                if slots.iter().all(Option::is_some) {
                    let first = self.first_endpoint;
                    let mut chunks = Vec::with_capacity(slots.len());
                    for (index, slot) in slots.iter_mut().enumerate() {
                        if let Some(chunk) = slot.take() {
                            chunks.push((first + index, chunk));
                        }
                    }

                    arena.push_outgoing(
                        self.sw.least_loaded_up_port(arena),
                        Message::InterSwitchGather {
                            destination: *expected,
                            chunks,
                        },
                    );
                    self.gather = GatherPhase::Idle;
                }

                Ok(())
            }
        }
    }

    /// Record one contribution toward a local gather destination. Returns
    /// true when every endpoint except the destination has contributed.
    fn gather_accumulate(
        &mut self,
        contributor: EndpointId,
        destination: EndpointId,
        data: Vec<f32>,
    ) -> Result<bool, SimError> {
        if data.is_empty() {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("gather chunk from endpoint {contributor} is empty"),
            ));
        }
        if contributor == destination {
            return Err(SimError::protocol(
                self.label.clone(),
                format!("gather contribution from the destination endpoint {destination}"),
            ));
        }

        match &mut self.gather {
            GatherPhase::CollectingToUp { .. } => Err(SimError::protocol(
                self.label.clone(),
                "gather toward an up-port is already in progress",
            )),
            GatherPhase::Idle => {
                let mut slots: Vec<Option<Vec<f32>>> = vec![None; self.topology.endpoints()];
                let chunk_len = data.len();
                slots[contributor] = Some(data);
                self.gather = GatherPhase::CollectingToDown {
                    destination,
                    chunk_len,
                    slots,
                };
                Ok(false)
            }
            GatherPhase::CollectingToDown {
                destination: expected,
                chunk_len,
                slots,
            } => {
                if *expected != destination {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("gather destination {destination} differs from expected {expected}"),
                    ));
                }
                if *chunk_len != data.len() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "gather chunk length {} differs from expected {chunk_len}",
                            data.len()
                        ),
                    ));
                }
                if slots[contributor].is_some() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("endpoint {contributor} already contributed to this gather"),
                    ));
                }

                slots[contributor] = Some(data);

                let filled = slots.iter().filter(|slot| slot.is_some()).count();
                Ok(filled == slots.len() - 1)
            }
        }
    }

    /// Emit the completed gather toward its local destination.
    fn emit_gather(&mut self, arena: &mut PortArena) -> Result<(), SimError> {
        let phase = std::mem::replace(&mut self.gather, GatherPhase::Idle);

        let GatherPhase::CollectingToDown {
            destination, slots, ..
        } = phase
        else {
            return Err(SimError::protocol(
                self.label.clone(),
                "gather completion without a downward collection",
            ));
        };

        let mut data = Vec::new();
        for slot in slots {
            if let Some(chunk) = slot {
                data.extend_from_slice(&chunk);
            }
        }

        let port = self.sw.down_port(destination - self.first_endpoint);
        arena.push_outgoing(port, Message::Gather { destination, data });

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
        if self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch gather arrived on a down-port",
            ));
        }

        let total = chunks.len();
        for (position, (contributor, data)) in chunks.into_iter().enumerate() {
            let done = self.gather_accumulate(contributor, destination, data)?;

            if done {
                if position + 1 != total {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "gather completed before consuming the whole bundle (entry {} of \
                             {total})",
                            position + 1
                        ),
                    ));
                }
                self.emit_gather(arena)?;
            }
        }

        Ok(())
    }

    fn on_all_gather(
        &mut self,
        arena: &mut PortArena,
        source_index: usize,
        data: Vec<f32>,
    ) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::protocol(
                self.label.clone(),
                "all-gather payload is empty",
            ));
        }
        let Some(down_index) = self.sw.down_index(source_index) else {
            return Err(SimError::protocol(
                self.label.clone(),
                "all-gather arrived on an up-port",
            ));
        };

        match &mut self.all_gather {
            AllGatherPhase::CollectingToDown { .. } => Err(SimError::protocol(
                self.label.clone(),
                "all-gather toward the down-ports is already in progress",
            )),
            AllGatherPhase::Idle => {
                let mut slots: Vec<Option<Vec<f32>>> = vec![None; self.sw.down_count()];
                let chunk_len = data.len();
                slots[down_index] = Some(data);
                self.all_gather = AllGatherPhase::CollectingToUp { chunk_len, slots };
                Ok(())
            }
            AllGatherPhase::CollectingToUp { chunk_len, slots } => {
                if slots[down_index].is_some() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!("port {source_index} already contributed to this all-gather"),
                    ));
                }
                if *chunk_len != data.len() {
                    return Err(SimError::protocol(
                        self.label.clone(),
                        format!(
                            "all-gather chunk length {} differs from expected {chunk_len}",
                            data.len()
                        ),
                    ));
                }

                slots[down_index] = Some(data);

                if slots.iter().all(Option::is_some) {
                    let first = self.first_endpoint;
                    let mut chunks = Vec::with_capacity(slots.len());
                    for (index, slot) in slots.iter_mut().enumerate() {
                        if let Some(chunk) = slot.take() {
                            chunks.push((first + index, chunk));
                        }
                    }

                    for up in 0..self.sw.up_count() {
                        arena.push_outgoing(
                            self.sw.up_port(up),
                            Message::InterSwitchAllGather {
                                chunks: chunks.clone(),
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
        if self.sw.is_down(source_index) {
            return Err(SimError::protocol(
                self.label.clone(),
                "inter-switch all-gather arrived on a down-port",
            ));
        }

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
                                    "all-gather result from port {source_index} differs from the \
                                     copy received earlier"
                                ),
                            ));
                        }
                    }
                }

                seen[source_index] = true;

                if all_set(seen) {
                    let Some(all) = chunks.take() else {
                        return Err(SimError::protocol(
                            self.label.clone(),
                            "all-gather completion without a collected result",
                        ));
                    };

                    if all.len() != self.topology.endpoints() {
                        return Err(SimError::protocol(
                            self.label.clone(),
                            format!(
                                "all-gather result carries {} chunks, expected {}",
                                all.len(),
                                self.topology.endpoints()
                            ),
                        ));
                    }
                    for (expected_id, (id, _)) in all.iter().enumerate() {
                        if *id != expected_id {
                            return Err(SimError::protocol(
                                self.label.clone(),
                                format!(
                                    "all-gather result is not ordered by endpoint id (found {id} \
                                     at position {expected_id})"
                                ),
                            ));
                        }
                    }

                    let mut combined = Vec::new();
                    for (_, chunk) in &all {
                        combined.extend_from_slice(chunk);
                    }

                    for down in 0..self.sw.down_count() {
                        arena.push_outgoing(
                            self.sw.down_port(down),
                            Message::AllGather {
                                data: combined.clone(),
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

// Collective engines are exercised end to end by the integration tests; the
// unit tests here pin the routing decisions that are easy to get wrong.
#[cfg(test)]
mod tests {
    use super::*;

    fn edge_under_test() -> (EdgeSwitch, PortArena, Vec<PortId>) {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let edge = EdgeSwitch::new(1, topology, true, &mut arena);

        // Give every switch port a peer so pushes have somewhere to land.
        let mut remotes = Vec::new();
        for index in 0..4 {
            let remote = arena.alloc();
            arena.connect(edge.sw.port(index), remote).unwrap();
            remotes.push(remote);
        }

        (edge, arena, remotes)
    }

    fn drain(arena: &mut PortArena, edge: &EdgeSwitch, remote: PortId) -> Vec<Message> {
        let mut received = Vec::new();
        for _ in 0..32 {
            edge.sw.tick_ports(arena);
            arena.tick(remote);
            while let Some(message) = arena.pop_incoming(remote) {
                received.push(message);
            }
        }
        received
    }

    #[test]
    fn unicast_prefers_local_down_port() {
        let (edge, mut arena, remotes) = edge_under_test();

        // Edge 1 with k=4 serves endpoints 2 and 3; port 3 is endpoint 3.
        let message = Message::Direct {
            source: 0,
            destination: 3,
            data: vec![1.0],
        };
        edge.route_unicast(&mut arena, 3, message);

        assert_eq!(arena.outgoing_len(edge.sw.port(3)), 1);
        let delivered = drain(&mut arena, &edge, remotes[3]);
        assert_eq!(delivered.len(), 1);
    }

    #[test]
    fn unicast_for_remote_endpoint_goes_up() {
        let (edge, mut arena, _) = edge_under_test();

        let message = Message::Direct {
            source: 2,
            destination: 7,
            data: vec![1.0],
        };
        edge.route_unicast(&mut arena, 7, message);

        assert_eq!(arena.outgoing_len(edge.sw.up_port(0)), 1);
        assert_eq!(arena.outgoing_len(edge.sw.up_port(1)), 0);
    }

    #[test]
    fn barrier_request_from_up_port_is_rejected() {
        let (mut edge, mut arena, _) = edge_under_test();

        assert!(edge.on_barrier_request(&mut arena, 0, 2).is_err());
        assert!(edge.on_barrier_request(&mut arena, 2, 2).is_ok());
        assert_eq!(arena.outgoing_len(edge.sw.up_port(0)), 1);
        assert_eq!(arena.outgoing_len(edge.sw.up_port(1)), 1);
    }

    #[test]
    fn reduce_up_uses_same_column_port() {
        let (mut edge, mut arena, _) = edge_under_test();

        // Edge 1 sits in column 1 of its pod.
        edge.on_reduce(&mut arena, 2, 7, ReduceOp::Sum, vec![1.0])
            .unwrap();
        edge.on_reduce(&mut arena, 3, 7, ReduceOp::Sum, vec![2.0])
            .unwrap();

        assert_eq!(arena.outgoing_len(edge.sw.up_port(0)), 0);
        assert_eq!(arena.outgoing_len(edge.sw.up_port(1)), 1);
    }

    #[test]
    fn duplicate_reduce_contribution_is_fatal() {
        let (mut edge, mut arena, _) = edge_under_test();

        edge.on_reduce(&mut arena, 2, 7, ReduceOp::Sum, vec![1.0])
            .unwrap();
        assert!(edge
            .on_reduce(&mut arena, 2, 7, ReduceOp::Sum, vec![1.0])
            .is_err());
    }

    #[test]
    fn mismatched_reduce_op_is_fatal() {
        let (mut edge, mut arena, _) = edge_under_test();

        edge.on_reduce(&mut arena, 2, 7, ReduceOp::Sum, vec![1.0])
            .unwrap();
        assert!(edge
            .on_reduce(&mut arena, 3, 7, ReduceOp::Max, vec![2.0])
            .is_err());
    }

    #[test]
    fn pure_routing_rejects_unaddressed_messages() {
        let topology = Topology::new(4).unwrap();
        let mut arena = PortArena::new();
        let edge = EdgeSwitch::new(0, topology, false, &mut arena);

        let result = edge.route_by_destination(
            &mut arena,
            Message::Broadcast {
                source: 0,
                data: vec![1.0],
            },
        );
        assert!(result.is_err());
    }
}
