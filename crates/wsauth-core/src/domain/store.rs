//! In-memory identity store.
//!
//! Production deployments point the gateway at their real user database by
//! implementing [`IdentityLookup`].  This store covers tests, demos and the
//! file-backed store the server binary loads at startup.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::identity::{Identity, IdentityId, IdentityLookup, LookupError};

/// A `HashMap`-backed identity store behind an async `RwLock`.
///
/// Reads (token verification) vastly outnumber writes (revocation), so a
/// read-write lock lets concurrent handshakes proceed in parallel.
#[derive(Debug, Default)]
pub struct InMemoryIdentityStore {
    identities: RwLock<HashMap<IdentityId, Identity>>,
}

impl InMemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store pre-populated with `identities`.  Later duplicates win.
    pub fn from_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let map = identities.into_iter().map(|i| (i.id, i)).collect();
        Self {
            identities: RwLock::new(map),
        }
    }

    /// Inserts or replaces an identity.
    pub async fn upsert(&self, identity: Identity) {
        self.identities.write().await.insert(identity.id, identity);
    }

    /// Removes an identity.  Returns `true` if it existed.
    pub async fn remove(&self, id: IdentityId) -> bool {
        self.identities.write().await.remove(&id).is_some()
    }

    /// Replaces the secret of an identity, revoking its outstanding tokens.
    ///
    /// Returns `false` if the identity does not exist.
    pub async fn set_secret(&self, id: IdentityId, secret: impl Into<String>) -> bool {
        let mut guard = self.identities.write().await;
        match guard.get_mut(&id) {
            Some(identity) => {
                identity.secret = secret.into();
                debug!("identity {id}: secret rotated, outstanding tokens revoked");
                true
            }
            None => false,
        }
    }

    /// Replaces the invalidation salt of an identity, revoking its
    /// outstanding tokens.
    ///
    /// Returns `false` if the identity does not exist.
    pub async fn set_invalidation_salt(&self, id: IdentityId, salt: Option<String>) -> bool {
        let mut guard = self.identities.write().await;
        match guard.get_mut(&id) {
            Some(identity) => {
                identity.invalidation_salt = salt;
                debug!("identity {id}: invalidation salt changed, outstanding tokens revoked");
                true
            }
            None => false,
        }
    }

    /// Number of identities in the store.
    pub async fn len(&self) -> usize {
        self.identities.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.identities.read().await.is_empty()
    }
}

#[async_trait]
impl IdentityLookup for InMemoryIdentityStore {
    async fn find_by_id(&self, id: IdentityId) -> Result<Identity, LookupError> {
        self.identities
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(LookupError::NotFound(id))
    }
}
