//! In-band vocabulary of the gateway.
//!
//! Three kinds of values live here:
//!
//! - [`Command`]: the two text frames the server interprets instead of
//!   treating them as chat payload (`"pingpong"` and `"clients"`).
//! - [`OutboundMessage`]: what the application layer asks a connection's
//!   writer task to put on the wire.  It is deliberately independent of
//!   `tungstenite::Message` so the application layer never touches sockets.
//! - [`Rejection`]: the close code and reason sent when the handshake
//!   decision refuses a connection.  Codes in the 2000 range are
//!   application-defined and stable; clients switch on them.

use std::fmt;

/// Close codes sent to rejected connections.
pub mod close_codes {
    /// More than one sub-protocol value was offered.
    pub const PROTOCOL_VIOLATION: u16 = 1002;
    pub const NO_TOKEN: u16 = 2000;
    pub const ANONYMOUS_NOT_PERMITTED: u16 = 2001;
    pub const INVALID_TOKEN: u16 = 2002;
}

// ── Commands ──────────────────────────────────────────────────────────────────

/// A text frame the server handles itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Re-arm the liveness probe.
    PingPong,
    /// Reply with the registry summary.
    Clients,
}

impl Command {
    /// Recognises a command; surrounding whitespace is ignored, case is not.
    ///
    /// Returns `None` for anything else, which the handler then treats as
    /// ordinary payload.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "pingpong" => Some(Self::PingPong),
            "clients" => Some(Self::Clients),
            _ => None,
        }
    }
}

// ── Outbound messages ─────────────────────────────────────────────────────────

/// A frame queued for one connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Vec<u8>),
    /// WebSocket Ping carrying the probe payload.
    Ping(Vec<u8>),
    Close { code: u16, reason: String },
}

impl OutboundMessage {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    /// Payload relayed to the other members in broadcast mode.
    pub fn tagged(label: &str, text: &str) -> Self {
        Self::Text(format!("{label}: {text}"))
    }

    /// Stand-in for a binary payload: only its length is relayed.
    pub fn binary_summary(label: &str, len: usize) -> Self {
        Self::Text(format!("{label}: <binary message, {len} bytes>"))
    }

    /// Presence announcement sent when a connection joins.
    pub fn announcement(label: &str) -> Self {
        Self::Text(format!("new user connected: {label}"))
    }
}

// ── Rejections ────────────────────────────────────────────────────────────────

/// Why a handshake was refused, in wire form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    pub code: u16,
    pub reason: &'static str,
}

impl Rejection {
    pub const fn protocol_violation() -> Self {
        Self {
            code: close_codes::PROTOCOL_VIOLATION,
            reason: "exactly one sub-protocol should be provided",
        }
    }

    pub const fn no_token() -> Self {
        Self {
            code: close_codes::NO_TOKEN,
            reason: "permission denied - no token supplied",
        }
    }

    pub const fn anonymous_not_permitted() -> Self {
        Self {
            code: close_codes::ANONYMOUS_NOT_PERMITTED,
            reason: "permission denied - anonymous users not permitted to connect to this socket",
        }
    }

    pub const fn invalid_token() -> Self {
        Self {
            code: close_codes::INVALID_TOKEN,
            reason: "permission denied - invalid token",
        }
    }

    /// Converts into the close frame queued for the writer.
    pub fn into_close(self) -> OutboundMessage {
        OutboundMessage::Close {
            code: self.code,
            reason: self.reason.to_string(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.reason, self.code)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
