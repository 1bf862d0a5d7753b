//! Domain entities for wsauth.
//!
//! This module contains pure types with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of the application is the **domain**.  Domain code
//! describes *what* the system is about (here: identities and who a
//! connection belongs to) without knowing *how* identities are stored or how
//! sockets are opened.  Outer layers depend on the domain; the domain never
//! depends on them.

/// Identity records, the anonymous/authenticated principal, and the lookup seam.
pub mod identity;

/// A ready-made in-memory implementation of [`identity::IdentityLookup`].
pub mod store;
