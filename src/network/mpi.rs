//! # Message-Passing Interface
//!
//! Each endpoint owns one [`Mpi`] value shared between two threads. The
//! simulation driver calls [`Mpi::tick`] to advance the endpoint's port and
//! sort freshly arrived messages into per-kind inboxes. The endpoint's task
//! runs on its own worker thread and issues the blocking calls below, each
//! of which waits on exactly one inbox until a matching entry appears.
//!
//! ## Hand-off discipline
//!
//! The port itself is touched only by the driver thread. The worker never
//! pushes into it directly; outgoing messages go through an unbounded
//! channel that the driver drains at the start of every tick. Each inbox
//! pairs a mutex-guarded queue with a condition variable, and waiting calls
//! rescan the queue in arrival order after every wakeup, so a non-matching
//! entry at the head is logged and skipped rather than aborting the call.
//!
//! ## Degraded mode
//!
//! When in-network computing is disabled the switches can only route by
//! destination id, so every collective here falls back to a naive protocol
//! composed purely of point-to-point exchanges. Endpoint-visible results
//! are identical in both modes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{trace, warn};

use crate::error::SimError;
use crate::network::message::{EndpointId, Message, MessageKind, ReduceOp};
use crate::network::port::{PortArena, PortId};
use crate::topology::Topology;

struct AckEntry {
    source: EndpointId,
    of: MessageKind,
}

struct DirectEntry {
    source: EndpointId,
    data: Vec<f32>,
}

struct BroadcastEntry {
    source: EndpointId,
    data: Vec<f32>,
}

struct ReduceEntry {
    op: ReduceOp,
    data: Vec<f32>,
}

struct ReduceAllEntry {
    op: ReduceOp,
    data: Vec<f32>,
}

struct ScatterEntry {
    source: EndpointId,
    data: Vec<f32>,
}

struct GatherEntry {
    data: Vec<f32>,
}

struct AllGatherEntry {
    data: Vec<f32>,
}

/// A mutex-guarded arrival queue with a condition variable, one per
/// message kind.
struct Inbox<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Inbox<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Driver side: append an entry and wake the worker.
    fn push(&self, entry: T) {
        self.queue.lock().push_back(entry);
        self.ready.notify_all();
    }

    /// Worker side: block until an entry matching the predicate exists,
    /// scanning in arrival order. Entries that do not match stay queued.
    fn take_matching<F>(&self, endpoint: EndpointId, what: &str, mut matches: F) -> T
    where
        F: FnMut(&T) -> bool,
    {
        let mut queue = self.queue.lock();
        loop {
            if let Some(position) = queue.iter().position(&mut matches) {
                if let Some(entry) = queue.remove(position) {
                    return entry;
                }
            }

            if !queue.is_empty() {
                warn!(
                    "endpoint {endpoint}: none of the {} queued entries match the awaited {what}, \
                     keeping waiting",
                    queue.len()
                );
            }

            self.ready.wait(&mut queue);
        }
    }
}

/// Counts pending barrier releases so a release that lands before the
/// worker starts waiting is not lost.
struct BarrierGate {
    pending: Mutex<usize>,
    released: Condvar,
}

impl BarrierGate {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.pending.lock() += 1;
        self.released.notify_all();
    }

    fn wait(&self) {
        let mut pending = self.pending.lock();
        while *pending == 0 {
            self.released.wait(&mut pending);
        }
        *pending -= 1;
    }
}

#[derive(Debug, Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
}

/// Message totals for one endpoint, exported into the run report.
#[derive(Debug, Clone, Serialize)]
pub struct MpiStats {
    pub endpoint: EndpointId,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// The per-endpoint message-passing interface.
pub struct Mpi {
    id: EndpointId,
    topology: Topology,
    compute_enabled: bool,
    outgoing_tx: Sender<Message>,
    outgoing_rx: Receiver<Message>,
    ack_inbox: Inbox<AckEntry>,
    direct_inbox: Inbox<DirectEntry>,
    broadcast_inbox: Inbox<BroadcastEntry>,
    reduce_inbox: Inbox<ReduceEntry>,
    reduce_all_inbox: Inbox<ReduceAllEntry>,
    scatter_inbox: Inbox<ScatterEntry>,
    gather_inbox: Inbox<GatherEntry>,
    all_gather_inbox: Inbox<AllGatherEntry>,
    barrier_gate: BarrierGate,
    counters: Counters,
}

impl Mpi {
    pub fn new(id: EndpointId, topology: Topology, compute_enabled: bool) -> Self {
        let (outgoing_tx, outgoing_rx) = channel::unbounded();

        trace!("mpi {id}: created");

        Self {
            id,
            topology,
            compute_enabled,
            outgoing_tx,
            outgoing_rx,
            ack_inbox: Inbox::new(),
            direct_inbox: Inbox::new(),
            broadcast_inbox: Inbox::new(),
            reduce_inbox: Inbox::new(),
            reduce_all_inbox: Inbox::new(),
            scatter_inbox: Inbox::new(),
            gather_inbox: Inbox::new(),
            all_gather_inbox: Inbox::new(),
            barrier_gate: BarrierGate::new(),
            counters: Counters::default(),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn stats(&self) -> MpiStats {
        MpiStats {
            endpoint: self.id,
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_received: self.counters.received.load(Ordering::Relaxed),
        }
    }

    /// Worker side: hand a message to the driver for transmission.
    fn enqueue_outgoing(&self, message: Message) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        // The receiving half lives in this struct, so the send cannot fail.
        let _ = self.outgoing_tx.send(message);
    }

    /// Driver side: drain the hand-off channel into the port, advance the
    /// port, and sort at most one ready message into its inbox.
    pub(crate) fn tick(&self, arena: &mut PortArena, port: PortId) -> Result<(), SimError> {
        for message in self.outgoing_rx.try_iter() {
            arena.push_outgoing(port, message);
        }

        arena.tick(port);

        let Some(message) = arena.pop_incoming(port) else {
            return Ok(());
        };

        self.counters.received.fetch_add(1, Ordering::Relaxed);
        trace!("mpi {}: received {}", self.id, message.kind());

        match message {
            Message::Acknowledge {
                source,
                destination,
                of,
            } => {
                if destination != self.id {
                    return Err(SimError::mpi(
                        self.id,
                        format!("received an acknowledgement for endpoint {destination}"),
                    ));
                }
                self.ack_inbox.push(AckEntry { source, of });
            }
            Message::Direct {
                source,
                destination,
                data,
            } => {
                if destination != self.id {
                    return Err(SimError::mpi(
                        self.id,
                        format!("received a direct message for endpoint {destination}"),
                    ));
                }
                self.direct_inbox.push(DirectEntry { source, data });
            }
            Message::Broadcast { source, data } => {
                if source == self.id {
                    return Err(SimError::mpi(self.id, "received its own broadcast"));
                }
                self.broadcast_inbox.push(BroadcastEntry { source, data });
            }
            Message::BarrierRelease => {
                self.barrier_gate.signal();
            }
            Message::Reduce {
                destination,
                op,
                data,
            } => {
                if destination != self.id {
                    return Err(SimError::mpi(
                        self.id,
                        format!("received a reduce result for endpoint {destination}"),
                    ));
                }
                self.reduce_inbox.push(ReduceEntry { op, data });
            }
            Message::ReduceAll { op, data } => {
                self.reduce_all_inbox.push(ReduceAllEntry { op, data });
            }
            Message::Scatter { source, data } => {
                if source == self.id {
                    return Err(SimError::mpi(self.id, "received its own scatter slice"));
                }
                self.scatter_inbox.push(ScatterEntry { source, data });
            }
            Message::Gather { destination, data } => {
                if destination != self.id {
                    return Err(SimError::mpi(
                        self.id,
                        format!("received a gathered payload for endpoint {destination}"),
                    ));
                }
                self.gather_inbox.push(GatherEntry { data });
            }
            Message::AllGather { data } => {
                self.all_gather_inbox.push(AllGatherEntry { data });
            }
            other => {
                return Err(SimError::mpi(
                    self.id,
                    format!("cannot process a {} message at an endpoint", other.kind()),
                ));
            }
        }

        Ok(())
    }

    /// Send `data` to another endpoint and block until it acknowledges.
    pub fn send(&self, data: &[f32], destination: EndpointId) -> Result<(), SimError> {
        trace!("mpi {}: sending {} values to {destination}", self.id, data.len());

        if data.is_empty() {
            return Err(SimError::mpi(self.id, "cannot send an empty message"));
        }
        if destination == self.id {
            return Err(SimError::mpi(self.id, "cannot send to itself"));
        }
        if destination >= self.topology.endpoints() {
            return Err(SimError::mpi(
                self.id,
                format!("destination {destination} is out of range"),
            ));
        }

        self.enqueue_outgoing(Message::Direct {
            source: self.id,
            destination,
            data: data.to_vec(),
        });

        self.ack_inbox
            .take_matching(self.id, "acknowledgement", |entry| {
                entry.source == destination && entry.of == MessageKind::Direct
            });

        Ok(())
    }

    /// Block until a message from `source` arrives, move its payload into
    /// `data` and acknowledge it. `data` must be empty on entry.
    pub fn receive(&self, data: &mut Vec<f32>, source: EndpointId) -> Result<(), SimError> {
        trace!("mpi {}: receiving from {source}", self.id);

        if !data.is_empty() {
            return Err(SimError::mpi(
                self.id,
                "receive destination must be empty",
            ));
        }
        if source == self.id {
            return Err(SimError::mpi(self.id, "cannot receive from itself"));
        }

        let entry = self
            .direct_inbox
            .take_matching(self.id, "direct message", |entry| entry.source == source);
        *data = entry.data;

        self.enqueue_outgoing(Message::acknowledge(self.id, source, MessageKind::Direct)?);

        Ok(())
    }

    /// As the source, publish `data` to every other endpoint and block until
    /// all of them acknowledged. As a receiver, block for the payload.
    pub fn broadcast(&self, data: &mut Vec<f32>, source: EndpointId) -> Result<(), SimError> {
        if !self.compute_enabled {
            return self.broadcast_naive(data, source);
        }

        if self.id == source {
            trace!("mpi {}: broadcasting {} values", self.id, data.len());

            if data.is_empty() {
                return Err(SimError::mpi(self.id, "cannot broadcast an empty message"));
            }

            self.enqueue_outgoing(Message::Broadcast {
                source,
                data: data.clone(),
            });

            self.collect_broadcast_acknowledgements()
        } else {
            if !data.is_empty() {
                return Err(SimError::mpi(
                    self.id,
                    "receive destination must be empty",
                ));
            }

            let entry = self
                .broadcast_inbox
                .take_matching(self.id, "broadcast", |entry| entry.source == source);
            *data = entry.data;

            self.enqueue_outgoing(Message::acknowledge(
                self.id,
                source,
                MessageKind::Broadcast,
            )?);

            Ok(())
        }
    }

    /// Wait until every other endpoint confirmed the broadcast. A second
    /// acknowledgement from the same endpoint means delivery went wrong.
    fn collect_broadcast_acknowledgements(&self) -> Result<(), SimError> {
        let mut acked = vec![false; self.topology.endpoints()];
        acked[self.id] = true;

        let mut queue = self.ack_inbox.queue.lock();
        loop {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].of == MessageKind::Broadcast {
                    let Some(entry) = queue.remove(index) else {
                        break;
                    };
                    if acked[entry.source] {
                        return Err(SimError::mpi(
                            self.id,
                            format!(
                                "duplicate broadcast acknowledgement from endpoint {}",
                                entry.source
                            ),
                        ));
                    }
                    acked[entry.source] = true;
                } else {
                    index += 1;
                }
            }

            if acked.iter().all(|&flag| flag) {
                trace!("mpi {}: received all broadcast acknowledgements", self.id);
                return Ok(());
            }

            self.ack_inbox.ready.wait(&mut queue);
        }
    }

    /// Block until every endpoint in the network entered the barrier.
    pub fn barrier(&self) -> Result<(), SimError> {
        trace!("mpi {}: entering barrier", self.id);

        if !self.compute_enabled {
            return self.barrier_naive();
        }

        self.enqueue_outgoing(Message::BarrierRequest { source: self.id });
        self.barrier_gate.wait();

        trace!("mpi {}: barrier released", self.id);
        Ok(())
    }

    /// Contribute `data` to a reduction rooted at `destination`. The root
    /// blocks for the network's fold and combines it with its own data.
    pub fn reduce(
        &self,
        data: &mut Vec<f32>,
        op: ReduceOp,
        destination: EndpointId,
    ) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::mpi(self.id, "cannot reduce an empty contribution"));
        }

        if !self.compute_enabled {
            return self.reduce_naive(data, op, destination);
        }

        if self.id == destination {
            let expected_len = data.len();
            let entry = self
                .reduce_inbox
                .take_matching(self.id, "reduce result", move |entry| {
                    entry.op == op && entry.data.len() == expected_len
                });
            op.fold_into(data, &entry.data);
        } else {
            self.enqueue_outgoing(Message::Reduce {
                destination,
                op,
                data: data.clone(),
            });
        }

        Ok(())
    }

    /// Contribute `data` to an unrooted reduction and block until the fold
    /// over all endpoints replaces it.
    pub fn reduce_all(&self, data: &mut Vec<f32>, op: ReduceOp) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::mpi(self.id, "cannot reduce an empty contribution"));
        }

        if !self.compute_enabled {
            return self.reduce_all_naive(data, op);
        }

        let expected_len = data.len();
        self.enqueue_outgoing(Message::ReduceAll {
            op,
            data: std::mem::take(data),
        });

        let entry = self
            .reduce_all_inbox
            .take_matching(self.id, "reduce-all result", move |entry| {
                entry.op == op && entry.data.len() == expected_len
            });
        *data = entry.data;

        Ok(())
    }

    /// As the source, distribute one equally sized slice of `data` to every
    /// endpoint, keeping its own. As a receiver, block for the slice.
    pub fn scatter(&self, data: &mut Vec<f32>, source: EndpointId) -> Result<(), SimError> {
        if !self.compute_enabled {
            return self.scatter_naive(data, source);
        }

        let endpoints = self.topology.endpoints();

        if self.id == source {
            if data.is_empty() {
                return Err(SimError::mpi(self.id, "cannot scatter an empty message"));
            }
            if data.len() % endpoints != 0 {
                return Err(SimError::mpi(
                    self.id,
                    format!(
                        "scatter payload length {} is not divisible by {endpoints}",
                        data.len()
                    ),
                ));
            }

            let chunk_len = data.len() / endpoints;
            let own_range = self.id * chunk_len..(self.id + 1) * chunk_len;
            let own: Vec<f32> = data[own_range.clone()].to_vec();

            let mut rest = std::mem::take(data);
            rest.drain(own_range);

            self.enqueue_outgoing(Message::Scatter { source, data: rest });
            *data = own;
        } else {
            if !data.is_empty() {
                return Err(SimError::mpi(
                    self.id,
                    "receive destination must be empty",
                ));
            }

            let entry = self
                .scatter_inbox
                .take_matching(self.id, "scatter slice", |entry| entry.source == source);
            *data = entry.data;
        }

        Ok(())
    }

    /// Contribute `data` to a collection rooted at `destination`. The root
    /// blocks for the aggregated payload and splices its own chunk in at
    /// its id offset.
    pub fn gather(&self, data: &mut Vec<f32>, destination: EndpointId) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::mpi(self.id, "cannot gather an empty contribution"));
        }

        if !self.compute_enabled {
            return self.gather_naive(data, destination);
        }

        if self.id == destination {
            let contributors = self.topology.endpoints() - 1;
            let chunk_len = data.len();
            let entry = self
                .gather_inbox
                .take_matching(self.id, "gathered payload", move |entry| {
                    entry.data.len() % contributors == 0
                        && entry.data.len() / contributors == chunk_len
                });

            let mut full = entry.data;
            let offset = self.id * chunk_len;
            full.splice(offset..offset, data.iter().copied());
            *data = full;
        } else {
            self.enqueue_outgoing(Message::Gather {
                destination,
                data: data.clone(),
            });
        }

        Ok(())
    }

    /// Contribute `data` and block until the concatenation of every
    /// endpoint's contribution, ordered by endpoint id, replaces it.
    pub fn all_gather(&self, data: &mut Vec<f32>) -> Result<(), SimError> {
        if data.is_empty() {
            return Err(SimError::mpi(self.id, "cannot gather an empty contribution"));
        }

        if !self.compute_enabled {
            return self.all_gather_naive(data);
        }

        let expected = data.len() * self.topology.endpoints();
        self.enqueue_outgoing(Message::AllGather {
            data: std::mem::take(data),
        });

        let entry = self
            .all_gather_inbox
            .take_matching(self.id, "all-gather result", move |entry| {
                entry.data.len() == expected
            });
        *data = entry.data;

        Ok(())
    }

    // Naive renditions used while in-network computing is disabled. Every
    // one of them is built only from send and receive, which the switches
    // can route in pure-forwarding mode.

    fn broadcast_naive(&self, data: &mut Vec<f32>, source: EndpointId) -> Result<(), SimError> {
        if self.id == source {
            if data.is_empty() {
                return Err(SimError::mpi(self.id, "cannot broadcast an empty message"));
            }
            for peer in 0..self.topology.endpoints() {
                if peer != self.id {
                    self.send(data, peer)?;
                }
            }
            Ok(())
        } else {
            self.receive(data, source)
        }
    }

    fn barrier_naive(&self) -> Result<(), SimError> {
        let endpoints = self.topology.endpoints();

        if self.id == 0 {
            for peer in 1..endpoints {
                let mut probe = Vec::new();
                self.receive(&mut probe, peer)?;
            }
            for peer in 1..endpoints {
                self.send(&[1.0], peer)?;
            }
            Ok(())
        } else {
            self.send(&[1.0], 0)?;
            let mut probe = Vec::new();
            self.receive(&mut probe, 0)
        }
    }

    fn reduce_naive(
        &self,
        data: &mut Vec<f32>,
        op: ReduceOp,
        destination: EndpointId,
    ) -> Result<(), SimError> {
        if self.id == destination {
            for peer in 0..self.topology.endpoints() {
                if peer == self.id {
                    continue;
                }

                let mut contribution = Vec::new();
                self.receive(&mut contribution, peer)?;
                if contribution.len() != data.len() {
                    return Err(SimError::mpi(
                        self.id,
                        format!(
                            "reduce contribution from endpoint {peer} has length {}, expected {}",
                            contribution.len(),
                            data.len()
                        ),
                    ));
                }
                op.fold_into(data, &contribution);
            }
            Ok(())
        } else {
            self.send(data, destination)
        }
    }

    fn reduce_all_naive(&self, data: &mut Vec<f32>, op: ReduceOp) -> Result<(), SimError> {
        self.reduce_naive(data, op, 0)?;

        if self.id == 0 {
            self.broadcast_naive(data, 0)
        } else {
            let mut result = Vec::new();
            self.broadcast_naive(&mut result, 0)?;
            *data = result;
            Ok(())
        }
    }

    fn scatter_naive(&self, data: &mut Vec<f32>, source: EndpointId) -> Result<(), SimError> {
        let endpoints = self.topology.endpoints();

        if self.id == source {
            if data.is_empty() {
                return Err(SimError::mpi(self.id, "cannot scatter an empty message"));
            }
            if data.len() % endpoints != 0 {
                return Err(SimError::mpi(
                    self.id,
                    format!(
                        "scatter payload length {} is not divisible by {endpoints}",
                        data.len()
                    ),
                ));
            }

            let chunk_len = data.len() / endpoints;
            for peer in 0..endpoints {
                if peer == self.id {
                    continue;
                }
                self.send(&data[peer * chunk_len..(peer + 1) * chunk_len], peer)?;
            }

            let own = data[self.id * chunk_len..(self.id + 1) * chunk_len].to_vec();
            *data = own;
            Ok(())
        } else {
            if !data.is_empty() {
                return Err(SimError::mpi(
                    self.id,
                    "receive destination must be empty",
                ));
            }
            self.receive(data, source)
        }
    }

    fn gather_naive(&self, data: &mut Vec<f32>, destination: EndpointId) -> Result<(), SimError> {
        if self.id == destination {
            let chunk_len = data.len();
            let mut full = Vec::with_capacity(chunk_len * self.topology.endpoints());

            for peer in 0..self.topology.endpoints() {
                if peer == self.id {
                    full.extend_from_slice(data);
                    continue;
                }

                let mut contribution = Vec::new();
                self.receive(&mut contribution, peer)?;
                if contribution.len() != chunk_len {
                    return Err(SimError::mpi(
                        self.id,
                        format!(
                            "gather contribution from endpoint {peer} has length {}, expected \
                             {chunk_len}",
                            contribution.len()
                        ),
                    ));
                }
                full.extend(contribution);
            }

            *data = full;
            Ok(())
        } else {
            self.send(data, destination)
        }
    }

    fn all_gather_naive(&self, data: &mut Vec<f32>) -> Result<(), SimError> {
        self.gather_naive(data, 0)?;

        if self.id == 0 {
            self.broadcast_naive(data, 0)
        } else {
            let mut result = Vec::new();
            self.broadcast_naive(&mut result, 0)?;
            *data = result;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mpi_with_link() -> (Mpi, PortArena, PortId, PortId) {
        let topology = Topology::new(4).unwrap();
        let mpi = Mpi::new(0, topology, true);
        let mut arena = PortArena::new();
        let local = arena.alloc();
        let remote = arena.alloc();
        arena.connect(local, remote).unwrap();

        (mpi, arena, local, remote)
    }

    /// Drive the mpi and its remote peer until the remote yields a message.
    fn pump_to_remote(
        mpi: &Mpi,
        arena: &mut PortArena,
        local: PortId,
        remote: PortId,
    ) -> Option<Message> {
        for _ in 0..32 {
            mpi.tick(arena, local).unwrap();
            arena.tick(remote);
            if let Some(message) = arena.pop_incoming(remote) {
                return Some(message);
            }
        }
        None
    }

    #[test]
    fn send_rejects_bad_arguments() {
        let (mpi, ..) = mpi_with_link();

        assert!(mpi.send(&[], 1).is_err());
        assert!(mpi.send(&[1.0], 0).is_err());
        assert!(mpi.send(&[1.0], 99).is_err());
    }

    #[test]
    fn receive_requires_empty_destination() {
        let (mpi, ..) = mpi_with_link();

        let mut data = vec![1.0];
        assert!(mpi.receive(&mut data, 1).is_err());

        let mut data = Vec::new();
        assert!(mpi.receive(&mut data, 0).is_err());
    }

    #[test]
    fn outgoing_messages_flow_through_the_port() {
        let (mpi, mut arena, local, remote) = mpi_with_link();

        mpi.enqueue_outgoing(Message::BarrierRequest { source: 0 });
        let message = pump_to_remote(&mpi, &mut arena, local, remote);
        assert!(matches!(message, Some(Message::BarrierRequest { source: 0 })));
    }

    #[test]
    fn tick_rejects_misdelivered_messages() {
        let (mpi, mut arena, local, remote) = mpi_with_link();

        arena.push_outgoing(
            remote,
            Message::Direct {
                source: 1,
                destination: 5,
                data: vec![1.0],
            },
        );

        let mut result = Ok(());
        for _ in 0..32 {
            arena.tick(remote);
            result = mpi.tick(&mut arena, local);
            if result.is_err() {
                break;
            }
        }
        assert!(result.is_err());
    }

    #[test]
    fn barrier_gate_keeps_early_releases() {
        let gate = BarrierGate::new();
        gate.signal();
        // The release arrived before the wait; the wait must not block.
        gate.wait();
    }

    #[test]
    fn inbox_scan_skips_non_matching_entries() {
        let inbox = Inbox::new();
        inbox.push(DirectEntry {
            source: 3,
            data: vec![3.0],
        });
        inbox.push(DirectEntry {
            source: 1,
            data: vec![1.0],
        });

        let entry = inbox.take_matching(0, "direct message", |entry| entry.source == 1);
        assert_eq!(entry.data, vec![1.0]);
        assert_eq!(inbox.queue.lock().len(), 1);
    }

    #[test]
    fn stats_track_message_totals() {
        let (mpi, mut arena, local, remote) = mpi_with_link();

        mpi.enqueue_outgoing(Message::BarrierRequest { source: 0 });
        pump_to_remote(&mpi, &mut arena, local, remote);

        let stats = mpi.stats();
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.messages_received, 0);
    }
}
