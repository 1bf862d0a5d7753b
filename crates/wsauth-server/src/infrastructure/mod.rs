//! Infrastructure layer for wsauth-server.
//!
//! The infrastructure layer handles all I/O: accepting WebSocket connections
//! and reading the identity file the bundled binary uses.
//!
//! # Responsibilities
//!
//! - Binding a TCP listener and performing the WebSocket upgrade
//! - Routing upgrades to endpoints and refusing unknown paths
//! - Spawning per-connection reader/writer tasks
//! - Handling the graceful shutdown signal
//! - Loading `[[identity]]` records from TOML
//!
//! # What does NOT belong here?
//!
//! - The accept/reject decision (application layer)
//! - Registry bookkeeping and broadcast (application layer)
//! - Configuration types (domain layer)

pub mod identity_file;
pub mod ws_server;

pub use identity_file::{load_identity_store, parse_identities, IdentityFileError};
pub use ws_server::{run_server, ServerDeps, WsServer};
