//! The simulated network: ports and links, the three switch tiers, the
//! message-passing interface, endpoints and the fabric that wires and
//! drives them.

pub mod endpoint;
pub mod fabric;
pub mod message;
pub mod mpi;
pub mod port;

pub(crate) mod aggregate;
pub(crate) mod core;
pub(crate) mod edge;
pub(crate) mod switch;

pub use endpoint::{Endpoint, EndpointTask};
pub use fabric::Fabric;
pub use message::{EndpointId, Message, MessageKind, ReduceOp};
pub use mpi::{Mpi, MpiStats};
pub use port::{PortArena, PortId};
