//! Accept/reject decision for a new connection.
//!
//! The browser WebSocket API cannot set arbitrary headers, but it can offer
//! sub-protocols.  Clients therefore put their token (or the anonymous
//! sentinel) in `Sec-WebSocket-Protocol`, and this module turns the offered
//! values into a [`HandshakeOutcome`] before any application logic runs.
//!
//! # Decision table
//!
//! | offered                 | `Optional` endpoint         | `Required` endpoint |
//! |-------------------------|-----------------------------|---------------------|
//! | nothing                 | accept anonymous            | reject 2000         |
//! | two or more values      | reject 1002                 | reject 1002         |
//! | the sentinel (`"anon"`) | accept anonymous, echo it   | reject 2001         |
//! | `""` or `"null"`        | accept anonymous            | reject 2000         |
//! | anything else           | verify: echo token / 2002   | verify: echo token / 2002 |
//!
//! Only one wire code exists for a bad token.  The precise [`TokenError`]
//! is logged here and never sent to the client.
//!
//! [`TokenError`]: wsauth_core::TokenError

use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info};
use wsauth_core::{IdentityLookup, Principal, TokenCodec};

use crate::domain::{AuthRequirement, Rejection};

/// Values browsers send when the page had no token to offer.
const MISSING_TOKEN_VALUES: [&str; 2] = ["", "null"];

/// Authentication strategy of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPolicy {
    Optional,
    Required,
}

impl From<AuthRequirement> for AuthPolicy {
    fn from(value: AuthRequirement) -> Self {
        match value {
            AuthRequirement::Optional => AuthPolicy::Optional,
            AuthRequirement::Required => AuthPolicy::Required,
        }
    }
}

/// Result of the handshake decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Proceed to registration.  `subprotocol` is the value to select in the
    /// upgrade response, if any.
    Accepted {
        principal: Principal,
        subprotocol: Option<String>,
    },
    /// Close with this code and reason; the connection is never registered.
    Rejected(Rejection),
}

impl HandshakeOutcome {
    fn anonymous(subprotocol: Option<String>) -> Self {
        Self::Accepted {
            principal: Principal::Anonymous,
            subprotocol,
        }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Splits raw `Sec-WebSocket-Protocol` header values into offered tokens.
///
/// The header may repeat and each occurrence may carry a comma-separated
/// list.  Blank entries are dropped.
pub fn offered_subprotocols<'a>(header_values: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    header_values
        .into_iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect()
}

/// Decides whether a connection may proceed, and as whom.
pub struct HandshakeAuthenticator {
    codec: TokenCodec,
    identities: Arc<dyn IdentityLookup>,
    anon_sentinel: String,
}

impl HandshakeAuthenticator {
    pub fn new(
        codec: TokenCodec,
        identities: Arc<dyn IdentityLookup>,
        anon_sentinel: impl Into<String>,
    ) -> Self {
        Self {
            codec,
            identities,
            anon_sentinel: anon_sentinel.into(),
        }
    }

    pub fn anon_sentinel(&self) -> &str {
        &self.anon_sentinel
    }

    /// Evaluates the offered sub-protocols once, before the connection opens.
    ///
    /// `remote_ip` is the client address the token must be bound to and
    /// `now` is the verification instant.
    pub async fn authenticate(
        &self,
        policy: AuthPolicy,
        offered: &[String],
        remote_ip: IpAddr,
        now: SystemTime,
    ) -> HandshakeOutcome {
        let candidate = match offered {
            [] => {
                return match policy {
                    AuthPolicy::Optional => HandshakeOutcome::anonymous(None),
                    AuthPolicy::Required => HandshakeOutcome::Rejected(Rejection::no_token()),
                };
            }
            [single] => single.as_str(),
            _ => {
                debug!("{remote_ip}: {} sub-protocols offered", offered.len());
                return HandshakeOutcome::Rejected(Rejection::protocol_violation());
            }
        };

        if candidate == self.anon_sentinel {
            return match policy {
                AuthPolicy::Optional => HandshakeOutcome::anonymous(Some(candidate.to_string())),
                AuthPolicy::Required => {
                    HandshakeOutcome::Rejected(Rejection::anonymous_not_permitted())
                }
            };
        }

        if MISSING_TOKEN_VALUES.contains(&candidate) {
            return match policy {
                AuthPolicy::Optional => HandshakeOutcome::anonymous(None),
                AuthPolicy::Required => HandshakeOutcome::Rejected(Rejection::no_token()),
            };
        }

        match self
            .codec
            .verify(candidate, remote_ip, now, self.identities.as_ref())
            .await
        {
            Ok(identity) => {
                debug!("{remote_ip}: token verified for {identity}");
                HandshakeOutcome::Accepted {
                    principal: Principal::Authenticated(identity),
                    subprotocol: Some(candidate.to_string()),
                }
            }
            Err(e) => {
                info!("{remote_ip}: token rejected: {e}");
                HandshakeOutcome::Rejected(Rejection::invalid_token())
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use wsauth_core::{Identity, InMemoryIdentityStore, TOKEN_EPOCH_UNIX_SECS};

    fn alice() -> Identity {
        Identity::new(7, "alice", "pbkdf2_sha256$alice")
    }

    fn now() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(TOKEN_EPOCH_UNIX_SECS + 1_000_000)
    }

    fn ip() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    fn authenticator() -> HandshakeAuthenticator {
        let store = InMemoryIdentityStore::from_identities([alice()]);
        HandshakeAuthenticator::new(TokenCodec::new("test-secret"), Arc::new(store), "anon")
    }

    fn offer(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn decide(policy: AuthPolicy, values: &[&str]) -> HandshakeOutcome {
        authenticator()
            .authenticate(policy, &offer(values), ip(), now())
            .await
    }

    #[tokio::test]
    async fn test_no_offer_optional_accepts_anonymous_without_subprotocol() {
        assert_eq!(
            decide(AuthPolicy::Optional, &[]).await,
            HandshakeOutcome::Accepted {
                principal: Principal::Anonymous,
                subprotocol: None
            }
        );
    }

    #[tokio::test]
    async fn test_no_offer_required_rejects_2000() {
        assert_eq!(
            decide(AuthPolicy::Required, &[]).await,
            HandshakeOutcome::Rejected(Rejection::no_token())
        );
    }

    #[tokio::test]
    async fn test_two_offers_reject_1002_on_both_policies() {
        for policy in [AuthPolicy::Optional, AuthPolicy::Required] {
            assert_eq!(
                decide(policy, &["anon", "other"]).await,
                HandshakeOutcome::Rejected(Rejection::protocol_violation())
            );
        }
    }

    #[tokio::test]
    async fn test_sentinel_optional_accepts_and_selects_sentinel() {
        assert_eq!(
            decide(AuthPolicy::Optional, &["anon"]).await,
            HandshakeOutcome::Accepted {
                principal: Principal::Anonymous,
                subprotocol: Some("anon".to_string())
            }
        );
    }

    #[tokio::test]
    async fn test_sentinel_required_rejects_2001() {
        assert_eq!(
            decide(AuthPolicy::Required, &["anon"]).await,
            HandshakeOutcome::Rejected(Rejection::anonymous_not_permitted())
        );
    }

    #[tokio::test]
    async fn test_null_token_is_treated_as_missing() {
        assert_eq!(
            decide(AuthPolicy::Required, &["null"]).await,
            HandshakeOutcome::Rejected(Rejection::no_token())
        );
        assert_eq!(
            decide(AuthPolicy::Optional, &["null"]).await,
            HandshakeOutcome::anonymous(None)
        );
    }

    #[tokio::test]
    async fn test_empty_token_is_treated_as_missing() {
        assert_eq!(
            decide(AuthPolicy::Required, &[""]).await,
            HandshakeOutcome::Rejected(Rejection::no_token())
        );
    }

    #[tokio::test]
    async fn test_garbage_token_rejects_2002() {
        for policy in [AuthPolicy::Optional, AuthPolicy::Required] {
            assert_eq!(
                decide(policy, &["this is bad!"]).await,
                HandshakeOutcome::Rejected(Rejection::invalid_token())
            );
        }
    }

    #[tokio::test]
    async fn test_valid_token_authenticates_and_selects_token() {
        // Arrange
        let auth = authenticator();
        let token = TokenCodec::new("test-secret").mint(&alice(), ip(), now());

        // Act
        let outcome = auth
            .authenticate(AuthPolicy::Required, &[token.clone()], ip(), now())
            .await;

        // Assert
        assert_eq!(
            outcome,
            HandshakeOutcome::Accepted {
                principal: Principal::Authenticated(alice()),
                subprotocol: Some(token)
            }
        );
    }

    #[tokio::test]
    async fn test_token_from_other_ip_rejects_2002() {
        let auth = authenticator();
        let token = TokenCodec::new("test-secret").mint(&alice(), ip(), now());
        let elsewhere: IpAddr = "10.0.0.3".parse().unwrap();

        let outcome = auth
            .authenticate(AuthPolicy::Optional, &[token], elsewhere, now())
            .await;

        assert_eq!(outcome, HandshakeOutcome::Rejected(Rejection::invalid_token()));
    }

    #[tokio::test]
    async fn test_custom_sentinel_is_honoured() {
        let store = InMemoryIdentityStore::new();
        let auth =
            HandshakeAuthenticator::new(TokenCodec::new("s"), Arc::new(store), "guest");

        let outcome = auth
            .authenticate(AuthPolicy::Optional, &offer(&["guest"]), ip(), now())
            .await;

        assert!(outcome.is_accepted());
        assert_eq!(auth.anon_sentinel(), "guest");
    }

    #[test]
    fn test_offered_subprotocols_splits_and_trims() {
        assert_eq!(
            offered_subprotocols(["a, b", "c"]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_offered_subprotocols_drops_blank_entries() {
        assert!(offered_subprotocols(["", " , "]).is_empty());
    }

    #[test]
    fn test_policy_from_requirement() {
        assert_eq!(AuthPolicy::from(AuthRequirement::Required), AuthPolicy::Required);
        assert_eq!(AuthPolicy::from(AuthRequirement::Optional), AuthPolicy::Optional);
    }
}
