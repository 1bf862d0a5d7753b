//! Minting and verification of WebSocket authentication tokens.
//!
//! # How a token is built
//!
//! ```text
//! value     = id_b36 ‖ secret ‖ client_ip ‖ invalidation_salt ‖ timestamp
//! key       = SHA-256(KEY_SALT ‖ server_secret_key)
//! signature = hex(HMAC-SHA256(key, value))
//! token     = ts_b36 "-" id_b36 "-" signature
//! ```
//!
//! `timestamp` is whole seconds since [`TOKEN_EPOCH_UNIX_SECS`]
//! (2015-01-01T00:00:00Z), which keeps the base-36 field short.
//!
//! # How a token is verified
//!
//! The verifier never trusts anything in the token except as a *claim*.  It
//! looks the identity up, re-derives the whole token from the identity's
//! *current* secret and salt, the claimed timestamp, and the IP address the
//! connection was actually observed from, and compares the result with the
//! presented token in constant time.  A token minted for another IP, another
//! secret, another salt or another timestamp therefore fails the same check.
//! Expiry is checked last.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::debug;

use super::base36::{decode_base36, encode_base36};
use crate::domain::identity::{Identity, IdentityLookup};

type HmacSha256 = Hmac<Sha256>;

/// Unix time of 2015-01-01T00:00:00Z, the zero point of token timestamps.
pub const TOKEN_EPOCH_UNIX_SECS: u64 = 1_420_070_400;

/// Default validity window: one day.
pub const DEFAULT_VALIDITY_SECS: u64 = 86_400;

/// Scheme-identifying salt mixed into the HMAC key.
const KEY_SALT: &str = "wsauth.tokens.WebSocketTokenGenerator";

/// Why a presented token was refused.
///
/// Callers must not forward the variant to the client: at the wire level
/// every failure looks the same ("invalid token").  The variants exist for
/// logging and tests.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TokenError {
    /// Not three dash-separated fields, or a field is not valid base 36.
    #[error("malformed token")]
    Malformed,

    /// The identity id did not resolve to exactly one identity.
    #[error("token refers to an unknown identity")]
    UnknownIdentity,

    /// The re-derived token does not match the presented one.
    #[error("token signature mismatch")]
    BadSignature,

    /// The token is older than the validity window.
    #[error("token expired")]
    Expired,
}

/// Converts a wall-clock time to token seconds.
///
/// Times before the token epoch saturate to zero.
pub fn token_seconds(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
        .saturating_sub(TOKEN_EPOCH_UNIX_SECS)
}

/// Mints and verifies tokens with one server secret and one validity window.
///
/// The codec holds no per-token state, so a single instance can be shared by
/// every connection (wrap it in an `Arc`).
#[derive(Clone)]
pub struct TokenCodec {
    key: [u8; 32],
    validity_secs: u64,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("key", &"<redacted>")
            .field("validity_secs", &self.validity_secs)
            .finish()
    }
}

impl TokenCodec {
    /// Creates a codec keyed by the server secret, with the default one-day
    /// validity window.
    pub fn new(server_secret: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_SALT.as_bytes());
        hasher.update(server_secret.as_ref());
        Self {
            key: hasher.finalize().into(),
            validity_secs: DEFAULT_VALIDITY_SECS,
        }
    }

    /// Overrides the validity window.
    pub fn with_validity_secs(mut self, validity_secs: u64) -> Self {
        self.validity_secs = validity_secs;
        self
    }

    pub fn validity_secs(&self) -> u64 {
        self.validity_secs
    }

    /// Mints a token for `identity`, bound to `client_ip`, issued at `now`.
    pub fn mint(&self, identity: &Identity, client_ip: IpAddr, now: SystemTime) -> String {
        self.mint_at(identity, client_ip, token_seconds(now))
    }

    /// Mints a token with an explicit timestamp in token seconds.
    pub fn mint_at(&self, identity: &Identity, client_ip: IpAddr, timestamp: u64) -> String {
        let ts_b36 = encode_base36(timestamp);
        let id_b36 = encode_base36(identity.id);
        let signature = self.signature(&id_b36, identity, client_ip, timestamp);
        format!("{ts_b36}-{id_b36}-{signature}")
    }

    /// Verifies `token` for a connection observed from `client_ip` at `now`.
    ///
    /// Never panics on hostile input: every failure is a [`TokenError`].
    ///
    /// # Errors
    ///
    /// - [`TokenError::Malformed`] – wrong shape or bad base-36 fields
    /// - [`TokenError::UnknownIdentity`] – lookup failed
    /// - [`TokenError::BadSignature`] – re-derived token differs
    /// - [`TokenError::Expired`] – `now - timestamp > validity window`
    pub async fn verify(
        &self,
        token: &str,
        client_ip: IpAddr,
        now: SystemTime,
        lookup: &dyn IdentityLookup,
    ) -> Result<Identity, TokenError> {
        let (timestamp, identity_id) = parse_claims(token)?;

        let identity = lookup.find_by_id(identity_id).await.map_err(|e| {
            debug!("token lookup failed: {e}");
            TokenError::UnknownIdentity
        })?;

        let expected = self.mint_at(&identity, client_ip, timestamp);
        if !bool::from(expected.as_bytes().ct_eq(token.as_bytes())) {
            return Err(TokenError::BadSignature);
        }

        let age = token_seconds(now).saturating_sub(timestamp);
        if age > self.validity_secs {
            return Err(TokenError::Expired);
        }

        Ok(identity)
    }

    fn signature(&self, id_b36: &str, identity: &Identity, client_ip: IpAddr, timestamp: u64) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC can take a key of any size");
        mac.update(id_b36.as_bytes());
        mac.update(identity.secret.as_bytes());
        mac.update(client_ip.to_string().as_bytes());
        mac.update(identity.salt_or_empty().as_bytes());
        mac.update(timestamp.to_string().as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Splits a token into its claimed (timestamp, identity id).
fn parse_claims(token: &str) -> Result<(u64, u64), TokenError> {
    let mut fields = token.split('-');
    let (Some(ts_b36), Some(id_b36), Some(_signature), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(TokenError::Malformed);
    };

    let timestamp = decode_base36(ts_b36).map_err(|_| TokenError::Malformed)?;
    let identity_id = decode_base36(id_b36).map_err(|_| TokenError::Malformed)?;
    Ok((timestamp, identity_id))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::store::InMemoryIdentityStore;

    const IP: &str = "127.0.0.1";

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn at(token_secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(TOKEN_EPOCH_UNIX_SECS + token_secs)
    }

    fn alice() -> Identity {
        Identity::new(42, "alice", "pbkdf2_sha256$hash")
    }

    #[test]
    fn test_token_seconds_is_relative_to_2015() {
        assert_eq!(token_seconds(at(0)), 0);
        assert_eq!(token_seconds(at(90)), 90);
        assert_eq!(token_seconds(UNIX_EPOCH), 0, "pre-epoch times saturate");
    }

    #[test]
    fn test_mint_produces_three_fields() {
        let codec = TokenCodec::new("server-secret");
        let token = codec.mint(&alice(), ip(IP), at(1_000));
        let fields: Vec<&str> = token.split('-').collect();
        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0], encode_base36(1_000));
        assert_eq!(fields[1], encode_base36(42));
        assert_eq!(fields[2].len(), 64, "hex SHA-256 output");
        assert!(fields[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_mint_is_deterministic() {
        let codec = TokenCodec::new("server-secret");
        assert_eq!(
            codec.mint(&alice(), ip(IP), at(5)),
            codec.mint(&alice(), ip(IP), at(5))
        );
    }

    #[test]
    fn test_server_secret_changes_signature() {
        let a = TokenCodec::new("one").mint(&alice(), ip(IP), at(5));
        let b = TokenCodec::new("two").mint(&alice(), ip(IP), at(5));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_claims_rejects_wrong_field_count() {
        assert_eq!(parse_claims(""), Err(TokenError::Malformed));
        assert_eq!(parse_claims("anon"), Err(TokenError::Malformed));
        assert_eq!(parse_claims("a-b"), Err(TokenError::Malformed));
        assert_eq!(parse_claims("a-b-c-d"), Err(TokenError::Malformed));
    }

    #[tokio::test]
    async fn test_verify_accepts_fresh_token() {
        // Arrange
        let codec = TokenCodec::new("server-secret");
        let store = InMemoryIdentityStore::from_identities([alice()]);
        let token = codec.mint(&alice(), ip(IP), at(100));

        // Act
        let result = codec.verify(&token, ip(IP), at(100), &store).await;

        // Assert
        assert_eq!(result, Ok(alice()));
    }

    #[tokio::test]
    async fn test_verify_unknown_identity() {
        let codec = TokenCodec::new("server-secret");
        let store = InMemoryIdentityStore::new();
        let token = codec.mint(&alice(), ip(IP), at(100));
        assert_eq!(
            codec.verify(&token, ip(IP), at(100), &store).await,
            Err(TokenError::UnknownIdentity)
        );
    }

    #[tokio::test]
    async fn test_verify_reports_expiry_after_signature() {
        let codec = TokenCodec::new("server-secret").with_validity_secs(10);
        let store = InMemoryIdentityStore::from_identities([alice()]);
        let token = codec.mint(&alice(), ip(IP), at(100));
        assert_eq!(
            codec.verify(&token, ip(IP), at(111), &store).await,
            Err(TokenError::Expired)
        );
    }

    #[tokio::test]
    async fn test_verify_future_timestamp_is_not_expired() {
        let codec = TokenCodec::new("server-secret").with_validity_secs(10);
        let store = InMemoryIdentityStore::from_identities([alice()]);
        let token = codec.mint(&alice(), ip(IP), at(500));
        assert!(codec.verify(&token, ip(IP), at(100), &store).await.is_ok());
    }

    #[test]
    fn test_debug_output_redacts_key() {
        let rendered = format!("{:?}", TokenCodec::new("server-secret"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("86400"));
    }
}
