//! # Fat-Tree Interconnect Simulator
//!
//! A discrete-time simulator of a k-ary fat-tree datacenter network that
//! transports MPI-style collective operations between compute endpoints.
//! This library provides the network fabric, the switch protocol engines,
//! and the blocking message-passing interface exposed to endpoint tasks.

pub mod cli;
pub mod error;
pub mod network;
pub mod report;
pub mod topology;

pub use cli::{Args, SimConfig};
pub use error::SimError;
pub use network::fabric::Fabric;
pub use network::message::{EndpointId, Message, MessageKind, ReduceOp};
pub use network::mpi::Mpi;
pub use report::RunReport;
pub use topology::Topology;

/// The current version of the simulator
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    /// Default number of ports per switch
    pub const PORTS_PER_SWITCH: usize = 4;

    /// Default upper bound on simulation ticks before a run is declared stalled
    pub const MAX_TICKS: u64 = 1_000_000;

    /// Base link delay in ticks, charged on both queue directions
    pub const BASE_LINK_DELAY: u64 = 3;

    /// Payload bytes that add one tick of link delay
    pub const BYTES_PER_TICK: u64 = 100;
}
