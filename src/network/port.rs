//! # Ports and Links
//!
//! A [`Port`] is one half of a point-to-point link. It owns an incoming and
//! an outgoing queue whose entries carry a remaining-tick countdown derived
//! from the message size, so larger payloads take proportionally longer to
//! traverse a link.
//!
//! Ports reference their peer across the link, so all ports of a fabric
//! live together in a [`PortArena`] and are addressed through stable
//! [`PortId`] handles. Moving a message from one port's outgoing queue into
//! the peer's incoming queue is then a plain ownership transfer between two
//! arena slots.
//!
//! ## Ordering
//!
//! Within one direction of a link, messages surface in the order they were
//! pushed. Only the head of a queue is ever eligible for transfer or
//! delivery, so a later message can never overtake an earlier one even when
//! their countdowns would both be zero.

use std::collections::VecDeque;

use tracing::error;

use crate::defaults::{BASE_LINK_DELAY, BYTES_PER_TICK};
use crate::error::SimError;
use crate::network::message::Message;

/// Stable handle of a port inside a [`PortArena`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PortId(usize);

/// A queued message together with the ticks left before it may move on.
#[derive(Debug)]
struct Pending {
    message: Message,
    remaining: u64,
}

/// One half-duplex link endpoint.
#[derive(Debug, Default)]
struct Port {
    peer: Option<PortId>,
    incoming: VecDeque<Pending>,
    outgoing: VecDeque<Pending>,
}

/// Owner of every port in the fabric.
#[derive(Debug, Default)]
pub struct PortArena {
    ports: Vec<Port>,
}

/// Queue delay charged to a message of the given size, identical for both
/// queue directions.
fn link_delay(size_bytes: usize) -> u64 {
    BASE_LINK_DELAY + size_bytes as u64 / BYTES_PER_TICK
}

impl PortArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh, unconnected port.
    pub fn alloc(&mut self) -> PortId {
        let id = PortId(self.ports.len());
        self.ports.push(Port::default());
        id
    }

    /// Connect two ports. The connection is symmetric and set once; trying
    /// to rewire an already connected port is a wiring error.
    pub fn connect(&mut self, a: PortId, b: PortId) -> Result<(), SimError> {
        if a == b {
            return Err(SimError::Wiring(format!(
                "port {} cannot be connected to itself",
                a.0
            )));
        }

        if self.ports[a.0].peer.is_some() || self.ports[b.0].peer.is_some() {
            return Err(SimError::Wiring(format!(
                "port {} or {} already has a remote port",
                a.0, b.0
            )));
        }

        self.ports[a.0].peer = Some(b);
        self.ports[b.0].peer = Some(a);

        Ok(())
    }

    /// True when the port has a peer and the peer agrees.
    pub fn is_connected(&self, id: PortId) -> bool {
        match self.ports[id.0].peer {
            Some(peer) => self.ports[peer.0].peer == Some(id),
            None => false,
        }
    }

    /// Queue a message for transmission, charged with the size-derived delay.
    pub fn push_outgoing(&mut self, id: PortId, message: Message) {
        let remaining = link_delay(message.size_bytes());
        self.ports[id.0]
            .outgoing
            .push_back(Pending { message, remaining });
    }

    /// Advance the port by one tick.
    ///
    /// If the head outgoing message has finished its countdown it is handed
    /// to the peer, which re-delays it on the incoming side. Only the head
    /// is considered. Afterwards every queued countdown decrements by one.
    pub fn tick(&mut self, id: PortId) {
        let head_due = self.ports[id.0]
            .outgoing
            .front()
            .map_or(false, |pending| pending.remaining == 0);

        if head_due {
            match self.ports[id.0].peer {
                Some(peer) => {
                    if let Some(pending) = self.ports[id.0].outgoing.pop_front() {
                        let remaining = link_delay(pending.message.size_bytes());
                        self.ports[peer.0].incoming.push_back(Pending {
                            message: pending.message,
                            remaining,
                        });
                    }
                }
                None => {
                    // Non-fatal: the message stays queued.
                    error!("port {}: cannot transfer message, no remote port", id.0);
                }
            }
        }

        let port = &mut self.ports[id.0];
        for pending in port.incoming.iter_mut().chain(port.outgoing.iter_mut()) {
            pending.remaining = pending.remaining.saturating_sub(1);
        }
    }

    /// True when the head incoming message is ready to be fetched.
    pub fn has_incoming(&self, id: PortId) -> bool {
        self.ports[id.0]
            .incoming
            .front()
            .map_or(false, |pending| pending.remaining == 0)
    }

    /// Take the head incoming message, if it is ready.
    pub fn pop_incoming(&mut self, id: PortId) -> Option<Message> {
        if !self.has_incoming(id) {
            return None;
        }

        self.ports[id.0]
            .incoming
            .pop_front()
            .map(|pending| pending.message)
    }

    /// Number of queued outgoing messages, used for load balancing.
    pub fn outgoing_len(&self, id: PortId) -> usize {
        self.ports[id.0].outgoing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::Message;

    fn probe(tag: f32) -> Message {
        Message::Broadcast {
            source: 0,
            data: vec![tag],
        }
    }

    /// Advance both ends of a link by one tick.
    fn tick_link(arena: &mut PortArena, a: PortId, b: PortId) {
        arena.tick(a);
        arena.tick(b);
    }

    #[test]
    fn connect_is_one_shot_and_symmetric() {
        let mut arena = PortArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        let c = arena.alloc();

        assert!(!arena.is_connected(a));
        arena.connect(a, b).unwrap();
        assert!(arena.is_connected(a));
        assert!(arena.is_connected(b));

        assert!(arena.connect(a, c).is_err());
        assert!(arena.connect(c, b).is_err());
        assert!(arena.connect(c, c).is_err());
    }

    #[test]
    fn small_message_crosses_after_base_delay() {
        let mut arena = PortArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        arena.connect(a, b).unwrap();

        arena.push_outgoing(a, probe(1.0));

        // Three ticks of outgoing countdown, a fourth to transfer, then the
        // incoming countdown. The receiving side ticks after the sending
        // side here, so its first decrement lands in the transfer round.
        for _ in 0..5 {
            tick_link(&mut arena, a, b);
            assert!(!arena.has_incoming(b));
        }
        tick_link(&mut arena, a, b);
        assert!(arena.has_incoming(b));

        match arena.pop_incoming(b) {
            Some(Message::Broadcast { data, .. }) => assert_eq!(data, vec![1.0]),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn payload_size_stretches_delay() {
        let mut arena = PortArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        arena.connect(a, b).unwrap();

        // 100 floats make 400 payload bytes, four extra ticks per direction.
        arena.push_outgoing(
            a,
            Message::Broadcast {
                source: 0,
                data: vec![0.0; 100],
            },
        );

        let mut ticks = 0;
        while !arena.has_incoming(b) {
            tick_link(&mut arena, a, b);
            ticks += 1;
            assert!(ticks < 100, "message never arrived");
        }
        assert!(ticks > 7, "large message arrived as fast as a small one");
    }

    #[test]
    fn fifo_per_direction() {
        let mut arena = PortArena::new();
        let a = arena.alloc();
        let b = arena.alloc();
        arena.connect(a, b).unwrap();

        for tag in 0..4 {
            arena.push_outgoing(a, probe(tag as f32));
        }

        let mut received = Vec::new();
        for _ in 0..64 {
            tick_link(&mut arena, a, b);
            if let Some(Message::Broadcast { data, .. }) = arena.pop_incoming(b) {
                received.push(data[0]);
            }
        }

        assert_eq!(received, vec![0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn unconnected_port_keeps_message() {
        let mut arena = PortArena::new();
        let a = arena.alloc();

        arena.push_outgoing(a, probe(9.0));
        for _ in 0..10 {
            arena.tick(a);
        }

        assert_eq!(arena.outgoing_len(a), 1);
    }
}
