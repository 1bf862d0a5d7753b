//! Domain layer for wsauth-server.
//!
//! Pure types with no dependencies on I/O, sockets, or the async runtime.
//!
//! # What belongs in the domain layer?
//!
//! - The server configuration and its endpoint table
//! - The in-band command vocabulary (`"pingpong"`, `"clients"`)
//! - Outbound message shapes and the stable rejection close codes
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, or `WebSocket` types
//! - File I/O beyond the explicit `ServerConfig::load` entry point

pub mod config;
pub mod messages;

pub use config::{AuthRequirement, ConfigError, EndpointConfig, MessageMode, SecretKey, ServerConfig};
pub use messages::{close_codes, Command, OutboundMessage, Rejection};
