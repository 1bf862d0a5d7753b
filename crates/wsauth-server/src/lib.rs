//! wsauth-server library crate.
//!
//! A WebSocket gateway that authenticates each connection with a short-lived
//! token carried as the `Sec-WebSocket-Protocol` value, tracks every open
//! connection in a shared registry, and measures per-connection latency with
//! WebSocket ping/pong.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (token as sub-protocol)
//!         ↕
//! [wsauth-server]
//!   ├── domain/           Pure types: ServerConfig, endpoints, commands, close codes
//!   ├── application/      Handshake decision, registry, liveness probe, handler
//!   └── infrastructure/
//!         ├── ws_server/     Accept loop and per-connection tasks (tokio-tungstenite)
//!         └── identity_file/ TOML-backed identity store for the binary
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `wsauth-core`; it talks to
//!   connections only through bounded channels, never through sockets.
//! - `infrastructure` depends on all other layers plus `tokio` and `tungstenite`.

/// Domain layer: configuration, endpoint table, in-band commands (no I/O).
pub mod domain;

/// Application layer: authentication decision, registry, probe, handler.
pub mod application;

/// Infrastructure layer: WebSocket server and identity file loading.
pub mod infrastructure;
