//! Identity records and the seam through which the token codec reads them.
//!
//! The identity store itself (user creation, password checks, persistence) is
//! owned by the primary authentication system.  wsauth only ever asks one
//! question of it: *"give me the current record for id N"*.  That question is
//! the [`IdentityLookup`] trait.
//!
//! # Revocation
//!
//! Every token signature covers the identity's `secret` and its optional
//! `invalidation_salt`.  Changing either value in the store therefore
//! invalidates every token previously minted for that identity, without the
//! gateway having to remember anything.

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Numeric identifier of an identity in the primary store.
pub type IdentityId = u64;

/// A user record as seen by the gateway.
///
/// `secret` is an opaque string owned by the identity store, typically the
/// stored password hash.  It never leaves the process: the `Debug`
/// implementation redacts it so it cannot end up in log output.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Identity {
    /// Primary key in the identity store.
    pub id: IdentityId,
    /// Display name used to tag broadcast messages.
    pub username: String,
    /// Current secret (password hash).  Part of every token signature.
    pub secret: String,
    /// Optional per-identity salt; changing it revokes outstanding tokens.
    #[serde(default)]
    pub invalidation_salt: Option<String>,
}

impl Identity {
    /// Creates an identity with no invalidation salt.
    pub fn new(id: IdentityId, username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
            secret: secret.into(),
            invalidation_salt: None,
        }
    }

    /// Builder-style setter for the invalidation salt.
    pub fn with_invalidation_salt(mut self, salt: impl Into<String>) -> Self {
        self.invalidation_salt = Some(salt.into());
        self
    }

    /// The salt as it enters the signature: the empty string when absent.
    pub fn salt_or_empty(&self) -> &str {
        self.invalidation_salt.as_deref().unwrap_or("")
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("invalidation_salt", &self.invalidation_salt.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (#{})", self.username, self.id)
    }
}

/// Who a connection belongs to.
///
/// Registry filters match on this tag rather than probing for an optional
/// field, so "is this connection authenticated?" has exactly one answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// No credential, the anonymous sentinel, or an endpoint that does not
    /// require one.
    Anonymous,
    /// A verified token bound this connection to an identity.
    Authenticated(Identity),
}

impl Principal {
    /// Returns `true` for [`Principal::Authenticated`].
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Principal::Authenticated(_))
    }

    /// The bound identity, if any.
    pub fn identity(&self) -> Option<&Identity> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated(identity) => Some(identity),
        }
    }

    /// Label used when tagging messages from this principal.
    pub fn label(&self) -> &str {
        match self {
            Principal::Anonymous => "anon",
            Principal::Authenticated(identity) => &identity.username,
        }
    }
}

/// Why a lookup did not produce exactly one identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    /// No identity has this id.
    #[error("identity {0} not found")]
    NotFound(IdentityId),

    /// The store returned more than one record for this id.
    #[error("identity lookup for {0} was ambiguous")]
    Ambiguous(IdentityId),

    /// The store could not be queried (timeout, connection loss, ...).
    ///
    /// The store owns its own timeout; the codec simply treats this like an
    /// unknown identity.
    #[error("identity store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only access to the primary identity store.
///
/// Implementations may perform I/O, which is why the method is async.  They
/// must bound their own latency; the token codec does not add a timeout.
#[async_trait]
pub trait IdentityLookup: Send + Sync {
    /// Returns the current record for `id`.
    ///
    /// # Errors
    ///
    /// Returns a [`LookupError`] when zero or several identities match, or the
    /// store is unavailable.
    async fn find_by_id(&self, id: IdentityId) -> Result<Identity, LookupError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────
