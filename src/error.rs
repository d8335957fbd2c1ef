//! Error taxonomy for the simulator.
//!
//! Errors fall into four groups: configuration problems caught before the
//! network is built, wiring mistakes caught during fabric construction,
//! protocol violations detected inside a switch engine, and misuse of the
//! message-passing interface by an endpoint task. Protocol violations always
//! indicate a real bug in the interface layer or in the user's call
//! sequencing, so the driver stops the run on the first one.

use thiserror::Error;

use crate::network::message::EndpointId;

/// Top-level error type for every fallible operation in the crate.
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration, reported before the simulation begins.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The fabric could not be wired, e.g. a port was connected twice.
    #[error("wiring error: {0}")]
    Wiring(String),

    /// A switch engine observed a message it cannot reconcile with its
    /// protocol state. The offending switch is identified by tier and id.
    #[error("protocol violation at {location}: {reason}")]
    Protocol { location: String, reason: String },

    /// An endpoint task misused the message-passing interface.
    #[error("mpi error at endpoint {endpoint}: {reason}")]
    Mpi { endpoint: EndpointId, reason: String },

    /// The run exceeded the configured tick budget without completing.
    #[error("simulation stalled: no completion after {0} ticks")]
    Stalled(u64),

    /// Writing the run report failed.
    #[error("report error: {0}")]
    Report(String),
}

impl SimError {
    /// Shorthand for a protocol violation at a named switch.
    pub fn protocol(location: impl Into<String>, reason: impl Into<String>) -> Self {
        SimError::Protocol {
            location: location.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an interface misuse error at an endpoint.
    pub fn mpi(endpoint: EndpointId, reason: impl Into<String>) -> Self {
        SimError::Mpi {
            endpoint,
            reason: reason.into(),
        }
    }
}
