//! Secret materialization and rotation.
//!
//! Secrets are declared through prefixed environment variables, fetched from
//! a [`SecretSource`], written to files under a base directory and published
//! to the wrapped process as `NAME=<path>`:
//! 1. **Materialize**: `SecretStore` fetches and writes every declared secret
//! 2. **Watch**: `RotationWatcher` polls versions and rewrites drifted secrets
//! 3. **Clean**: `SecretStore::clean` removes every file and env var at shutdown

pub mod env;
pub mod providers;
pub mod store;
pub mod watcher;

pub use env::{EnvError, Environment, MemoryEnvironment, ProcessEnvironment};
pub use store::{SecretStore, StoreError};
pub use watcher::{PollOutcome, RotationEvent, RotationWatcher, WatcherHandle};

use async_trait::async_trait;
use std::path::PathBuf;

// ============================================================================
// Secret
// ============================================================================

/// A secret tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    /// Opaque reference handed to the source.
    pub identifier: String,
    /// Environment variable the child reads to find the file.
    pub env_name: String,
    /// Version token from the source. Empty until first materialized.
    pub version: String,
    /// Absolute path of the materialized file.
    pub path: PathBuf,
}

impl Secret {
    /// A secret that has not been materialized yet.
    pub fn new(
        identifier: impl Into<String>,
        env_name: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            env_name: env_name.into(),
            version: String::new(),
            path: path.into(),
        }
    }

    pub fn is_materialized(&self) -> bool {
        !self.version.is_empty()
    }
}

// ============================================================================
// Source Trait
// ============================================================================

/// Errors returned by a [`SecretSource`].
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("secret '{0}' not found")]
    NotFound(String),

    #[error("identifier '{identifier}' rejected: {reason}")]
    Rejected { identifier: String, reason: String },

    #[error("source failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Backend capable of fetching secret values and version tokens.
///
/// Versions are compared for equality only; a source may return any token
/// as long as it changes whenever the value does.
#[async_trait]
pub trait SecretSource: Send + Sync {
    /// Display name for logging.
    fn name(&self) -> &str;

    /// Fetch the raw value for `identifier`.
    async fn get_value(&self, identifier: &str) -> Result<Vec<u8>, SourceError>;

    /// Fetch the current version token for `identifier`.
    async fn get_version(&self, identifier: &str) -> Result<String, SourceError>;
}

/// Hex SHA-256 of a payload, used as a version token by content-addressed
/// sources.
pub fn content_version(payload: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_secret_is_not_materialized() {
        let secret = Secret::new("arn:db", "DB", "/tmp/DB");
        assert!(!secret.is_materialized());
        assert_eq!(secret.path, PathBuf::from("/tmp/DB"));
    }

    #[test]
    fn content_version_tracks_content() {
        let a = content_version(b"pw123");
        assert_eq!(a, content_version(b"pw123"));
        assert_ne!(a, content_version(b"pw124"));
        assert_eq!(a.len(), 64);
    }
}
