//! The wsauth token scheme.
//!
//! # Wire format
//!
//! ```text
//! <timestamp base36>-<identity id base36>-<hex HMAC-SHA256 signature>
//! ```
//!
//! All three fields are ASCII and none of them can contain `-`, so splitting
//! on the dash is unambiguous.
//!
//! # Sub-modules
//!
//! - [`base36`] – compact integer encoding used for the first two fields.
//! - [`codec`] – minting and verification.

pub mod base36;
pub mod codec;

pub use base36::{decode_base36, encode_base36, Base36Error};
pub use codec::{token_seconds, TokenCodec, TokenError};
