//! # Message Model
//!
//! Every payload that travels through the network is one variant of the
//! closed [`Message`] enum, so switches and the endpoint interface dispatch
//! with a single exhaustive match. The enum covers the endpoint-visible
//! kinds (point-to-point, broadcast, barrier, the collective families) and
//! the three inter-switch kinds that only ever travel between switch tiers,
//! carrying explicit `(endpoint, chunk)` pairs.
//!
//! Messages are never shared: ownership moves from the sender's outgoing
//! queue across the link into the receiver's incoming queue and finally
//! into the consuming engine.

use std::fmt;

use crate::error::SimError;

/// Identifier of a compute endpoint, in `[0, N)`.
pub type EndpointId = usize;

/// A per-endpoint data chunk carried by the inter-switch collective kinds.
pub type Chunk = (EndpointId, Vec<f32>);

/// Elementwise reduction operators supported by the collective engines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Multiply,
    Max,
    Min,
}

impl ReduceOp {
    /// Combine two values under this operator.
    pub fn apply(self, lhs: f32, rhs: f32) -> f32 {
        match self {
            ReduceOp::Sum => lhs + rhs,
            ReduceOp::Multiply => lhs * rhs,
            ReduceOp::Max => {
                if lhs > rhs {
                    lhs
                } else {
                    rhs
                }
            }
            ReduceOp::Min => {
                if lhs < rhs {
                    lhs
                } else {
                    rhs
                }
            }
        }
    }

    /// Fold `other` elementwise into `acc`. Lengths must already match.
    pub fn fold_into(self, acc: &mut [f32], other: &[f32]) {
        for (lhs, rhs) in acc.iter_mut().zip(other.iter()) {
            *lhs = self.apply(*lhs, *rhs);
        }
    }
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReduceOp::Sum => "Sum",
            ReduceOp::Multiply => "Multiply",
            ReduceOp::Max => "Max",
            ReduceOp::Min => "Min",
        };
        write!(f, "{name}")
    }
}

/// Discriminant-only view of a message, used for acknowledgements, inbox
/// routing and log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    Acknowledge,
    Direct,
    Broadcast,
    BarrierRequest,
    BarrierRelease,
    Reduce,
    ReduceAll,
    Scatter,
    Gather,
    AllGather,
    InterSwitchScatter,
    InterSwitchGather,
    InterSwitchAllGather,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Acknowledge => "Acknowledge",
            MessageKind::Direct => "DirectMessage",
            MessageKind::Broadcast => "BroadcastMessage",
            MessageKind::BarrierRequest => "BarrierRequest",
            MessageKind::BarrierRelease => "BarrierRelease",
            MessageKind::Reduce => "Reduce",
            MessageKind::ReduceAll => "ReduceAll",
            MessageKind::Scatter => "Scatter",
            MessageKind::Gather => "Gather",
            MessageKind::AllGather => "AllGather",
            MessageKind::InterSwitchScatter => "InterSwitch::Scatter",
            MessageKind::InterSwitchGather => "InterSwitch::Gather",
            MessageKind::InterSwitchAllGather => "InterSwitch::AllGather",
        };
        write!(f, "{name}")
    }
}

/// One message in flight. See the module documentation for the lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Delivery confirmation for a previously received message. The
    /// acknowledged kind can never itself be `Acknowledge`.
    Acknowledge {
        source: EndpointId,
        destination: EndpointId,
        of: MessageKind,
    },

    /// Point-to-point payload between two endpoints.
    Direct {
        source: EndpointId,
        destination: EndpointId,
        data: Vec<f32>,
    },

    /// One-to-all payload, fanned out by the switch tiers.
    Broadcast { source: EndpointId, data: Vec<f32> },

    /// Entry announcement for a barrier cycle.
    BarrierRequest { source: EndpointId },

    /// Barrier completion signal. Carries no addressing; it floods downward.
    BarrierRelease,

    /// Contribution to (or result of) a rooted reduction.
    Reduce {
        destination: EndpointId,
        op: ReduceOp,
        data: Vec<f32>,
    },

    /// Contribution to (or result of) an unrooted reduction.
    ReduceAll { op: ReduceOp, data: Vec<f32> },

    /// Per-endpoint slice of a rooted distribution.
    Scatter { source: EndpointId, data: Vec<f32> },

    /// Contribution to (or result of) a rooted collection.
    Gather {
        destination: EndpointId,
        data: Vec<f32>,
    },

    /// Contribution to (or result of) an unrooted collection.
    AllGather { data: Vec<f32> },

    /// Bundled scatter slices between switch tiers, one entry per
    /// destination endpoint still to be served.
    InterSwitchScatter {
        source: EndpointId,
        chunks: Vec<Chunk>,
    },

    /// Bundled gather contributions between switch tiers, one entry per
    /// contributing endpoint.
    InterSwitchGather {
        destination: EndpointId,
        chunks: Vec<Chunk>,
    },

    /// Bundled all-gather contributions between switch tiers.
    InterSwitchAllGather { chunks: Vec<Chunk> },
}

impl Message {
    /// Build an acknowledgement for a received message of kind `of`.
    pub fn acknowledge(
        source: EndpointId,
        destination: EndpointId,
        of: MessageKind,
    ) -> Result<Self, SimError> {
        if of == MessageKind::Acknowledge {
            return Err(SimError::mpi(
                source,
                "an acknowledgement cannot acknowledge another acknowledgement",
            ));
        }

        Ok(Message::Acknowledge {
            source,
            destination,
            of,
        })
    }

    /// The discriminant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Acknowledge { .. } => MessageKind::Acknowledge,
            Message::Direct { .. } => MessageKind::Direct,
            Message::Broadcast { .. } => MessageKind::Broadcast,
            Message::BarrierRequest { .. } => MessageKind::BarrierRequest,
            Message::BarrierRelease => MessageKind::BarrierRelease,
            Message::Reduce { .. } => MessageKind::Reduce,
            Message::ReduceAll { .. } => MessageKind::ReduceAll,
            Message::Scatter { .. } => MessageKind::Scatter,
            Message::Gather { .. } => MessageKind::Gather,
            Message::AllGather { .. } => MessageKind::AllGather,
            Message::InterSwitchScatter { .. } => MessageKind::InterSwitchScatter,
            Message::InterSwitchGather { .. } => MessageKind::InterSwitchGather,
            Message::InterSwitchAllGather { .. } => MessageKind::InterSwitchAllGather,
        }
    }

    /// Destination endpoint, for the kinds that carry one. Used by unicast
    /// routing and by the pure-routing fallback when in-network computing
    /// is disabled.
    pub fn destination(&self) -> Option<EndpointId> {
        match self {
            Message::Acknowledge { destination, .. }
            | Message::Direct { destination, .. }
            | Message::Reduce { destination, .. }
            | Message::Gather { destination, .. }
            | Message::InterSwitchGather { destination, .. } => Some(*destination),
            _ => None,
        }
    }

    /// Deterministic byte estimate used to compute link delay: a fixed
    /// header, 8 bytes per carried address, 4 bytes per payload element and
    /// 8 bytes per chunk entry in the inter-switch kinds.
    pub fn size_bytes(&self) -> usize {
        const HEADER: usize = 8;
        const ADDRESS: usize = 8;

        fn payload(data: &[f32]) -> usize {
            4 * data.len()
        }

        fn chunked(chunks: &[Chunk]) -> usize {
            chunks
                .iter()
                .map(|(_, data)| ADDRESS + payload(data))
                .sum()
        }

        match self {
            Message::Acknowledge { .. } => HEADER + 2 * ADDRESS + 1,
            Message::Direct { data, .. } => HEADER + 2 * ADDRESS + payload(data),
            Message::Broadcast { data, .. } => HEADER + ADDRESS + payload(data),
            Message::BarrierRequest { .. } => HEADER + ADDRESS,
            Message::BarrierRelease => HEADER,
            Message::Reduce { data, .. } => HEADER + ADDRESS + 1 + payload(data),
            Message::ReduceAll { data, .. } => HEADER + 1 + payload(data),
            Message::Scatter { data, .. } => HEADER + ADDRESS + payload(data),
            Message::Gather { data, .. } => HEADER + ADDRESS + payload(data),
            Message::AllGather { data } => HEADER + payload(data),
            Message::InterSwitchScatter { chunks, .. } => HEADER + ADDRESS + chunked(chunks),
            Message::InterSwitchGather { chunks, .. } => HEADER + ADDRESS + chunked(chunks),
            Message::InterSwitchAllGather { chunks } => HEADER + chunked(chunks),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_op_identities() {
        assert_eq!(ReduceOp::Sum.apply(2.0, 3.0), 5.0);
        assert_eq!(ReduceOp::Multiply.apply(2.0, 3.0), 6.0);
        assert_eq!(ReduceOp::Max.apply(2.0, 3.0), 3.0);
        assert_eq!(ReduceOp::Min.apply(2.0, 3.0), 2.0);
    }

    #[test]
    fn fold_is_elementwise() {
        let mut acc = vec![1.0, 5.0, -2.0];
        ReduceOp::Max.fold_into(&mut acc, &[0.0, 7.0, -3.0]);
        assert_eq!(acc, vec![1.0, 7.0, -2.0]);
    }

    #[test]
    fn acknowledgements_cannot_nest() {
        assert!(Message::acknowledge(0, 1, MessageKind::Direct).is_ok());
        assert!(Message::acknowledge(0, 1, MessageKind::Acknowledge).is_err());
    }

    #[test]
    fn size_grows_with_payload() {
        let small = Message::Direct {
            source: 0,
            destination: 1,
            data: vec![0.0; 4],
        };
        let large = Message::Direct {
            source: 0,
            destination: 1,
            data: vec![0.0; 400],
        };

        assert_eq!(large.size_bytes() - small.size_bytes(), 4 * 396);
    }

    #[test]
    fn destination_only_on_addressed_kinds() {
        assert_eq!(
            Message::Direct {
                source: 0,
                destination: 3,
                data: vec![1.0],
            }
            .destination(),
            Some(3)
        );
        assert_eq!(Message::BarrierRelease.destination(), None);
        assert_eq!(
            Message::Broadcast {
                source: 2,
                data: vec![1.0],
            }
            .destination(),
            None
        );
    }
}
