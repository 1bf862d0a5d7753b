//! Application layer for wsauth-server.
//!
//! Everything here talks to connections through bounded `mpsc` channels of
//! [`OutboundMessage`](crate::domain::OutboundMessage), never through
//! sockets, which keeps every use case testable with a plain receiver.
//!
//! - [`handshake`]: accept/reject decision from the offered sub-protocols
//! - [`registry`]: the shared set of open connections and broadcast
//! - [`liveness`]: Ping/Pong round-trip measurement
//! - [`handler`]: per-connection orchestration of the above

pub mod handler;
pub mod handshake;
pub mod liveness;
pub mod registry;

pub use handler::ConnectionHandler;
pub use handshake::{offered_subprotocols, AuthPolicy, HandshakeAuthenticator, HandshakeOutcome};
pub use liveness::{LatencyHandler, LivenessProbe, LoggingLatencyHandler};
pub use registry::{
    BroadcastReport, ClientCounts, ConnectionHandle, ConnectionId, ConnectionRegistry,
    DeliveryError, Filter, RegistryError,
};
