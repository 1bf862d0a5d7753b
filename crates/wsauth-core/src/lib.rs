//! # wsauth-core
//!
//! Shared library for wsauth containing the WebSocket token scheme and the
//! identity types the gateway authenticates against.
//!
//! It has zero dependencies on sockets, HTTP, or the WebSocket framing layer,
//! so everything in here can be unit-tested without a network.
//!
//! # Architecture overview (for beginners)
//!
//! A web application (the "primary authentication system") already knows who
//! its users are.  When it renders a page for a logged-in user it also mints a
//! short-lived **token** bound to that user *and* to the IP address the page
//! was requested from.  The browser then opens a WebSocket to the gateway and
//! offers the token as its single `Sec-WebSocket-Protocol` value.  The gateway
//! re-derives the token signature from the current identity record and the
//! connecting IP; if everything matches and the token is fresh, the socket is
//! bound to that identity.
//!
//! This crate defines:
//!
//! - **`token`** – base-36 helpers and the [`TokenCodec`] that mints and
//!   verifies tokens.
//!
//! - **`domain`** – [`Identity`], the [`Principal`] sum type
//!   (anonymous vs. authenticated), and the [`IdentityLookup`] seam through
//!   which the codec reads the identity store.

pub mod domain;
pub mod token;

// Re-export the most-used types at the crate root so callers can write
// `wsauth_core::TokenCodec` instead of `wsauth_core::token::codec::TokenCodec`.
pub use domain::identity::{Identity, IdentityId, IdentityLookup, LookupError, Principal};
pub use domain::store::InMemoryIdentityStore;
pub use token::codec::{TokenCodec, TokenError, DEFAULT_VALIDITY_SECS, TOKEN_EPOCH_UNIX_SECS};
