//! Materialized secret store.
//!
//! Owns the tracked set: every secret whose value was fetched successfully,
//! in insertion order, at most one entry per identifier. The store is the
//! only component that writes secret files or publishes their paths through
//! the environment.
//!
//! The store holds no lock. It is used from setup first, then moved into the
//! rotation watcher's task and handed back on stop, so there is never more
//! than one `create_secret` in flight.

use super::env::{EnvError, Environment};
use super::{Secret, SecretSource, SourceError};
use crate::config::{DEFAULT_ENV_PREFIX, DEFAULT_POLL_TIMEOUT_MS};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors from materializing or cleaning secrets.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to fetch {operation} of secret '{identifier}': {source}")]
    Source {
        identifier: String,
        operation: &'static str,
        #[source]
        source: SourceError,
    },

    #[error("timed out after {timeout:?} fetching {operation} of secret '{identifier}'")]
    Timeout {
        identifier: String,
        operation: &'static str,
        timeout: Duration,
    },

    #[error("failed to write secret file '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching {operation} of secret '{identifier}' was cancelled")]
    Cancelled {
        identifier: String,
        operation: &'static str,
    },

    #[error("secret path '{}' is not valid UTF-8", path.display())]
    NonUtf8Path { path: PathBuf },

    #[error("invalid secret declaration '{key}': {reason}")]
    InvalidDeclaration { key: String, reason: &'static str },

    #[error(transparent)]
    Environment(#[from] EnvError),

    #[error("cleanup failed for {failed} of {total} secret(s)")]
    Cleanup { failed: usize, total: usize },
}

/// Tracks materialized secrets and keeps their files and env vars current.
pub struct SecretStore {
    source: Arc<dyn SecretSource>,
    env: Arc<dyn Environment>,
    base_path: PathBuf,
    prefix: String,
    fetch_timeout: Duration,
    tracked: Vec<Secret>,
    /// Aborts in-flight fetches; writes already started run to completion.
    cancel: CancellationToken,
}

impl SecretStore {
    /// Create a store writing under `base_path`. Relative paths are resolved
    /// against the current directory so published paths are absolute.
    pub fn new(
        source: Arc<dyn SecretSource>,
        env: Arc<dyn Environment>,
        base_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            source,
            env,
            base_path: absolute(base_path.into()),
            prefix: DEFAULT_ENV_PREFIX.to_string(),
            fetch_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
            tracked: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Deadline applied to each individual fetch.
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Fetches fail with [`StoreError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn source(&self) -> &Arc<dyn SecretSource> {
        &self.source
    }

    pub fn environment(&self) -> &Arc<dyn Environment> {
        &self.env
    }

    /// Tracked secrets in insertion order.
    pub fn secrets(&self) -> &[Secret] {
        &self.tracked
    }

    pub fn get(&self, identifier: &str) -> Option<&Secret> {
        self.tracked.iter().find(|s| s.identifier == identifier)
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    /// Current version of `identifier`, bounded by the store's fetch timeout.
    pub async fn fetch_version(&self, identifier: &str) -> Result<String, StoreError> {
        self.fetch_version_within(identifier, self.fetch_timeout)
            .await
    }

    /// Current version of `identifier`, bounded by `deadline`.
    pub async fn fetch_version_within(
        &self,
        identifier: &str,
        deadline: Duration,
    ) -> Result<String, StoreError> {
        bounded(
            identifier,
            "version",
            deadline,
            &self.cancel,
            self.source.get_version(identifier),
        )
        .await
    }

    async fn fetch_value(&self, identifier: &str) -> Result<Vec<u8>, StoreError> {
        bounded(
            identifier,
            "value",
            self.fetch_timeout,
            &self.cancel,
            self.source.get_value(identifier),
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Materialization
    // ------------------------------------------------------------------------

    /// Materialize every prefixed variable in `vars`.
    ///
    /// `PREFIX_NAME=identifier` becomes a file at `base_path/NAME` and the
    /// variable `NAME=<path>`; the prefixed variable is removed. Stops at the
    /// first error; secrets materialized before it stay in place.
    pub async fn materialize_from_environment<I, K, V>(
        &mut self,
        vars: I,
    ) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut count = 0;
        for (key, value) in vars {
            let key = key.as_ref();
            let Some(secret) = self.declaration(key, value.as_ref())? else {
                continue;
            };
            self.create_secret(secret).await?;
            self.env.unset(key)?;
            count += 1;
        }

        info!(
            count,
            base_path = %self.base_path.display(),
            "Materialized secrets from environment"
        );
        Ok(count)
    }

    /// Interpret one environment entry as a secret declaration.
    ///
    /// Returns `Ok(None)` for entries that do not carry the prefix.
    pub fn declaration(&self, key: &str, value: &str) -> Result<Option<Secret>, StoreError> {
        let Some(name) = key.strip_prefix(self.prefix.as_str()) else {
            return Ok(None);
        };

        if name.is_empty() {
            warn!(key, "Ignoring secret declaration with empty name");
            return Ok(None);
        }

        let invalid = |reason| StoreError::InvalidDeclaration {
            key: key.to_string(),
            reason,
        };
        if name.contains('/') || name.contains('\\') {
            return Err(invalid("name contains a path separator"));
        }
        if name == "." || name == ".." {
            return Err(invalid("name is a relative path component"));
        }
        if value.is_empty() {
            return Err(invalid("identifier is empty"));
        }
        if self.get(value).is_some_and(|existing| existing.env_name != name) {
            return Err(invalid("identifier is already declared under another name"));
        }

        Ok(Some(Secret::new(value, name, self.base_path.join(name))))
    }

    /// Fetch, write and publish one secret.
    ///
    /// The version is fetched before the value. If either fetch fails the
    /// tracked set is left untouched. On success the value is written to
    /// `secret.path`, `secret.env_name` is pointed at it, and the secret is
    /// appended to the tracked set, or its existing entry updated in place
    /// when the identifier is already tracked. An entry that moved to a new
    /// name or path has its old file removed and old variable unset.
    pub async fn create_secret(&mut self, secret: Secret) -> Result<(), StoreError> {
        let version = self.fetch_version(&secret.identifier).await?;
        let value = self.fetch_value(&secret.identifier).await?;

        let path_str = secret
            .path
            .to_str()
            .ok_or_else(|| StoreError::NonUtf8Path {
                path: secret.path.clone(),
            })?
            .to_string();

        write_secret_file(&secret.path, &value)
            .await
            .map_err(|source| StoreError::Write {
                path: secret.path.clone(),
                source,
            })?;
        self.env.set(&secret.env_name, &path_str)?;

        info!(
            identifier = %secret.identifier,
            version = %version,
            path = %path_str,
            env = %secret.env_name,
            "Materialized secret"
        );

        let updated = Secret { version, ..secret };
        let Some(index) = self
            .tracked
            .iter()
            .position(|s| s.identifier == updated.identifier)
        else {
            self.tracked.push(updated);
            return Ok(());
        };

        let old = std::mem::replace(&mut self.tracked[index], updated);
        let current = &self.tracked[index];
        if old.path != current.path {
            debug!(
                identifier = %old.identifier,
                old_path = %old.path.display(),
                "Secret moved, removing old file"
            );
            remove_secret_file(&old);
        }
        if old.env_name != current.env_name {
            if let Err(e) = self.env.unset(&old.env_name) {
                warn!(
                    identifier = %old.identifier,
                    env = %old.env_name,
                    "Failed to unset superseded secret variable: {e}"
                );
            }
        }

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------------

    /// Remove every secret file and unset every published variable.
    ///
    /// Each secret is attempted even if an earlier one fails; failures are
    /// logged and summarized in [`StoreError::Cleanup`]. The tracked set is
    /// empty afterwards, so a second call is a no-op.
    pub fn clean(&mut self) -> Result<usize, StoreError> {
        let secrets: Vec<Secret> = self.tracked.drain(..).collect();
        let total = secrets.len();
        let mut failed = 0;

        for secret in &secrets {
            let mut ok = remove_secret_file(secret);

            if let Err(e) = self.env.unset(&secret.env_name) {
                warn!(
                    identifier = %secret.identifier,
                    env = %secret.env_name,
                    "Failed to unset secret variable: {e}"
                );
                ok = false;
            }

            if !ok {
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(StoreError::Cleanup { failed, total });
        }
        info!(count = total, "Cleaned up secrets");
        Ok(total)
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore")
            .field("source", &self.source.name())
            .field("base_path", &self.base_path)
            .field("prefix", &self.prefix)
            .field("tracked", &self.tracked.len())
            .finish()
    }
}

/// Run a source call under a deadline.
async fn bounded<T, F>(
    identifier: &str,
    operation: &'static str,
    deadline: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, SourceError>>,
{
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            return Err(StoreError::Cancelled {
                identifier: identifier.to_string(),
                operation,
            });
        }
        result = tokio::time::timeout(deadline, fut) => result,
    };
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(StoreError::Source {
            identifier: identifier.to_string(),
            operation,
            source,
        }),
        Err(_) => Err(StoreError::Timeout {
            identifier: identifier.to_string(),
            operation,
            timeout: deadline,
        }),
    }
}

/// Remove a secret's file, treating an already missing file as success.
fn remove_secret_file(secret: &Secret) -> bool {
    match std::fs::remove_file(&secret.path) {
        Ok(()) => true,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %secret.path.display(), "Secret file already removed");
            true
        }
        Err(e) => {
            warn!(
                identifier = %secret.identifier,
                path = %secret.path.display(),
                "Failed to remove secret file: {e}"
            );
            false
        }
    }
}

/// Write `value` to `path` through a sibling temp file and a rename, so a
/// failed write never leaves a truncated secret behind.
async fn write_secret_file(path: &Path, value: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "secret path has no parent")
    })?;
    let name = path.file_name().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "secret path has no file name")
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let tmp = dir.join(format!(
        ".{}.{}.tmp",
        name.to_string_lossy(),
        uuid::Uuid::new_v4().simple()
    ));

    let result = async {
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        options.mode(0o600);

        let mut file = options.open(&tmp).await?;
        file.write_all(value).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, path).await
    }
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}
