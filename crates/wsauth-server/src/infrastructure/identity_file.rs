//! TOML-backed identity records for the bundled binary.
//!
//! In production the identity store belongs to the primary authentication
//! system and is reached through [`IdentityLookup`].  For standalone
//! deployments and local development the binary can instead load a flat file:
//!
//! ```toml
//! [[identity]]
//! id = 1
//! username = "alice"
//! secret = "pbkdf2_sha256$..."
//!
//! [[identity]]
//! id = 2
//! username = "bob"
//! secret = "pbkdf2_sha256$..."
//! invalidation_salt = "rotated-2026-10"
//! ```
//!
//! Editing `secret` or `invalidation_salt` and restarting revokes that
//! identity's outstanding tokens.
//!
//! [`IdentityLookup`]: wsauth_core::IdentityLookup

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use wsauth_core::{Identity, IdentityId, InMemoryIdentityStore};

/// Error type for identity file loading.
#[derive(Debug, Error)]
pub enum IdentityFileError {
    #[error("I/O error reading identities at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse identity TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("identity id {0} appears more than once")]
    DuplicateId(IdentityId),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct IdentityFile {
    #[serde(default, rename = "identity")]
    identities: Vec<Identity>,
}

/// Parses identity records from TOML text.
///
/// # Errors
///
/// Returns [`IdentityFileError::Parse`] for invalid TOML and
/// [`IdentityFileError::DuplicateId`] when two records share an id.
pub fn parse_identities(text: &str) -> Result<Vec<Identity>, IdentityFileError> {
    let file: IdentityFile = toml::from_str(text)?;
    let mut seen = HashSet::new();
    for identity in &file.identities {
        if !seen.insert(identity.id) {
            return Err(IdentityFileError::DuplicateId(identity.id));
        }
    }
    Ok(file.identities)
}

/// Reads `path` and builds an [`InMemoryIdentityStore`] from it.
///
/// # Errors
///
/// Returns [`IdentityFileError::Io`] if the file cannot be read, otherwise
/// as [`parse_identities`].
pub fn load_identity_store(path: &Path) -> Result<InMemoryIdentityStore, IdentityFileError> {
    let text = std::fs::read_to_string(path).map_err(|source| IdentityFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(InMemoryIdentityStore::from_identities(parse_identities(&text)?))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use wsauth_core::IdentityLookup;

    const TWO_IDENTITIES: &str = r#"
        [[identity]]
        id = 1
        username = "alice"
        secret = "hash-a"

        [[identity]]
        id = 2
        username = "bob"
        secret = "hash-b"
        invalidation_salt = "rotated"
    "#;

    #[test]
    fn test_parse_reads_all_records() {
        // Act
        let identities = parse_identities(TWO_IDENTITIES).unwrap();

        // Assert
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].username, "alice");
        assert_eq!(identities[0].invalidation_salt, None);
        assert_eq!(identities[1].invalidation_salt.as_deref(), Some("rotated"));
    }

    #[test]
    fn test_parse_empty_file_yields_no_identities() {
        assert!(parse_identities("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_rejects_duplicate_ids() {
        let text = r#"
            [[identity]]
            id = 1
            username = "a"
            secret = "x"

            [[identity]]
            id = 1
            username = "b"
            secret = "y"
        "#;
        assert!(matches!(
            parse_identities(text),
            Err(IdentityFileError::DuplicateId(1))
        ));
    }

    #[test]
    fn test_parse_rejects_missing_secret() {
        let text = r#"
            [[identity]]
            id = 1
            username = "a"
        "#;
        assert!(matches!(parse_identities(text), Err(IdentityFileError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let result = load_identity_store(Path::new("/definitely/not/here/identities.toml"));
        assert!(matches!(result, Err(IdentityFileError::Io { .. })));
    }

    #[tokio::test]
    async fn test_load_builds_queryable_store() {
        // Arrange
        let path = std::env::temp_dir().join(format!("wsauth-ids-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, TWO_IDENTITIES).unwrap();

        // Act
        let store = load_identity_store(&path).unwrap();
        std::fs::remove_file(&path).ok();

        // Assert
        assert_eq!(store.len().await, 2);
        assert_eq!(store.find_by_id(2).await.unwrap().username, "bob");
    }
}
