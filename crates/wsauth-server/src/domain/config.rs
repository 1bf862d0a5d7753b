//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings.
//! It is read from an optional TOML file and then overridden by CLI arguments
//! (see `main.rs`).  Every field has a serde default, so an empty file, or no
//! file at all, yields a working development configuration.
//!
//! ```toml
//! bind_addr = "0.0.0.0:8001"
//! secret_key = "change-me"
//! token_validity_secs = 86400
//! anon_sentinel = "anon"
//! identities_path = "identities.toml"
//!
//! [[endpoints]]
//! path = "/ws/"
//! auth = "optional"
//! mode = "broadcast"
//! announce = true
//! ping_interval_secs = 30
//! ```
//!
//! # Design rationale
//!
//! Keeping configuration as a plain struct (no global state) makes the server
//! easy to embed in tests: each test builds its own `ServerConfig` and binds
//! its own listener on port 0.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use wsauth_core::DEFAULT_VALIDITY_SECS;

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("endpoint path {0:?} must start with '/'")]
    InvalidPath(String),

    #[error("endpoint path {0:?} is configured more than once")]
    DuplicateEndpoint(String),

    #[error("anon_sentinel must not be empty")]
    EmptySentinel,

    #[error("outbound_queue must be at least 1")]
    ZeroQueue,
}

// ── Endpoint table ────────────────────────────────────────────────────────────

/// Whether an endpoint accepts anonymous connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthRequirement {
    /// Anonymous connections are accepted; a valid token upgrades them.
    Optional,
    /// Only connections presenting a valid token are accepted.
    Required,
}

/// What an endpoint does with ordinary (non-command) messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageMode {
    /// Reply to the sender with the same payload.
    Echo,
    /// Fan the message out to every other registered connection.
    Broadcast,
}

/// One WebSocket endpoint served by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointConfig {
    /// Request path, matched exactly (e.g. `/ws/`).
    pub path: String,
    pub auth: AuthRequirement,
    pub mode: MessageMode,
    /// Tell the other members when a connection joins.
    #[serde(default)]
    pub announce: bool,
    /// Period of the liveness probe.  `None` means: probe once on open and
    /// then only when the client sends `"pingpong"`.
    #[serde(default)]
    pub ping_interval_secs: Option<u64>,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>, auth: AuthRequirement, mode: MessageMode) -> Self {
        Self {
            path: path.into(),
            auth,
            mode,
            announce: false,
            ping_interval_secs: None,
        }
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

// ── Secret key ────────────────────────────────────────────────────────────────

/// The server secret that keys token signatures.
///
/// A newtype so the value never shows up in `Debug` output of the config.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

// ── Server config ─────────────────────────────────────────────────────────────

/// All runtime configuration for the gateway.
///
/// Build this once at startup and wrap it in an `Arc` so it can be shared
/// cheaply across all connection tasks.
///
/// # Example
///
/// ```rust
/// use wsauth_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 8001);
/// assert_eq!(cfg.token_validity_secs, 86400);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,

    /// HMAC key material for tokens.  Required to serve or mint; usually
    /// supplied through `WSAUTH_SECRET_KEY` rather than the file.
    #[serde(default)]
    pub secret_key: Option<SecretKey>,

    /// Maximum token age in seconds (inclusive).
    #[serde(default = "default_token_validity_secs")]
    pub token_validity_secs: u64,

    /// Sub-protocol value meaning "I am deliberately anonymous".
    #[serde(default = "default_anon_sentinel")]
    pub anon_sentinel: String,

    /// Take the client IP from the first `X-Forwarded-For` hop.  Only enable
    /// behind a reverse proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,

    /// Depth of each connection's outbound queue.  A full queue drops the
    /// message for that recipient only.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// How long a rejected connection waits for the client's close reply.
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,

    /// TOML file with `[[identity]]` entries for the bundled identity store.
    #[serde(default)]
    pub identities_path: Option<PathBuf>,

    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8001))
}

fn default_token_validity_secs() -> u64 {
    DEFAULT_VALIDITY_SECS
}

fn default_anon_sentinel() -> String {
    "anon".to_string()
}

fn default_outbound_queue() -> usize {
    64
}

fn default_close_timeout_ms() -> u64 {
    1_000
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![
        EndpointConfig {
            announce: true,
            ..EndpointConfig::new("/ws/", AuthRequirement::Optional, MessageMode::Broadcast)
        },
        EndpointConfig::new("/ws/echo/", AuthRequirement::Optional, MessageMode::Echo),
        EndpointConfig::new("/ws/auth/", AuthRequirement::Required, MessageMode::Echo),
    ]
}

impl Default for ServerConfig {
    /// Returns a configuration suitable for local development.
    ///
    /// | Field               | Default            |
    /// |---------------------|--------------------|
    /// | bind_addr           | `0.0.0.0:8001`     |
    /// | secret_key          | none               |
    /// | token_validity_secs | 86400              |
    /// | anon_sentinel       | `"anon"`           |
    /// | trust_forwarded_for | false              |
    /// | outbound_queue      | 64                 |
    /// | close_timeout_ms    | 1000               |
    /// | endpoints           | `/ws/`, `/ws/echo/`, `/ws/auth/` |
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            secret_key: None,
            token_validity_secs: default_token_validity_secs(),
            anon_sentinel: default_anon_sentinel(),
            trust_forwarded_for: false,
            outbound_queue: default_outbound_queue(),
            close_timeout_ms: default_close_timeout_ms(),
            identities_path: None,
            endpoints: default_endpoints(),
        }
    }
}

impl ServerConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for invalid TOML or unknown keys, and
    /// the validation variants described on [`ServerConfig::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, otherwise as
    /// [`ServerConfig::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks the invariants serde cannot express.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::NoEndpoints`] – the endpoint table is empty
    /// - [`ConfigError::InvalidPath`] – a path does not start with `/`
    /// - [`ConfigError::DuplicateEndpoint`] – two endpoints share a path
    /// - [`ConfigError::EmptySentinel`] – `anon_sentinel` is empty
    /// - [`ConfigError::ZeroQueue`] – `outbound_queue` is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        let mut seen = HashSet::new();
        for endpoint in &self.endpoints {
            if !endpoint.path.starts_with('/') {
                return Err(ConfigError::InvalidPath(endpoint.path.clone()));
            }
            if !seen.insert(endpoint.path.as_str()) {
                return Err(ConfigError::DuplicateEndpoint(endpoint.path.clone()));
            }
        }
        if self.anon_sentinel.is_empty() {
            return Err(ConfigError::EmptySentinel);
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::ZeroQueue);
        }
        Ok(())
    }

    /// Finds the endpoint serving `path` (exact match).
    pub fn endpoint(&self, path: &str) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.path == path)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
