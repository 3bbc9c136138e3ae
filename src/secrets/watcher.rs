//! Rotation watcher.
//!
//! Polls the version of every tracked secret on a fixed interval and
//! re-materializes the ones that drifted. A tick that rotated at least one
//! secret produces exactly one [`RotationEvent`], however many secrets
//! changed; consumers should treat it as "secrets changed", not as naming
//! which one.
//!
//! The store is moved into the polling task for as long as the watcher runs
//! and is handed back by [`WatcherHandle::stop`]. Secrets are checked one at
//! a time, in insertion order, and ticks never overlap.

use super::store::SecretStore;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_POLL_FREQUENCY_MS, DEFAULT_POLL_TIMEOUT_MS};

/// Notification that one or more secrets were rewritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationEvent {
    pub at: DateTime<Utc>,
    /// Secrets rotated in the tick that produced this event.
    pub rotated: usize,
}

/// Counters for one polling iteration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Secrets whose version was looked up.
    pub checked: usize,
    /// Secrets whose version differed from the stored one.
    pub drifted: usize,
    /// Drifted secrets that were re-materialized.
    pub rotated: usize,
    /// Lookups or re-materializations that failed.
    pub failed: usize,
}

/// Polling configuration. Consumed by [`start`](Self::start).
#[derive(Debug, Clone)]
pub struct RotationWatcher {
    frequency: Duration,
    timeout: Duration,
}

impl Default for RotationWatcher {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_POLL_FREQUENCY_MS),
            Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        )
    }
}

impl RotationWatcher {
    /// `frequency` is the tick interval, `timeout` the deadline for each
    /// version lookup.
    pub fn new(frequency: Duration, timeout: Duration) -> Self {
        Self {
            frequency: frequency.max(Duration::from_millis(1)),
            timeout,
        }
    }

    pub fn frequency(&self) -> Duration {
        self.frequency
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Spawn the polling task, taking ownership of `store`.
    ///
    /// The first check runs one interval after start.
    pub fn start(self, store: SecretStore) -> (WatcherHandle, mpsc::Receiver<RotationEvent>) {
        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();

        info!(
            frequency = ?self.frequency,
            timeout = ?self.timeout,
            secrets = store.len(),
            "Starting rotation watcher"
        );
        let task = tokio::spawn(self.run(store, tx, cancel.clone()));

        (
            WatcherHandle {
                cancel,
                task: Some(task),
            },
            rx,
        )
    }

    async fn run(
        self,
        mut store: SecretStore,
        tx: mpsc::Sender<RotationEvent>,
        cancel: CancellationToken,
    ) -> SecretStore {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.frequency, self.frequency);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let outcome = self.check_once(&mut store, &cancel).await;
            debug!(
                checked = outcome.checked,
                drifted = outcome.drifted,
                rotated = outcome.rotated,
                failed = outcome.failed,
                "Rotation check complete"
            );
            if outcome.rotated == 0 {
                continue;
            }

            let event = RotationEvent {
                at: Utc::now(),
                rotated: outcome.rotated,
            };
            // Blocks until the supervisor takes the previous event.
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sent = tx.send(event) => {
                    if sent.is_err() {
                        debug!("Rotation event receiver dropped");
                    }
                }
            }
        }

        debug!("Rotation watcher stopped");
        store
    }

    /// Run one polling iteration over `store`.
    ///
    /// Lookup and re-materialization errors are logged and counted, never
    /// returned; a failed secret keeps its previous file and version and is
    /// retried on the next call.
    pub async fn check_once(
        &self,
        store: &mut SecretStore,
        cancel: &CancellationToken,
    ) -> PollOutcome {
        let mut outcome = PollOutcome::default();
        let snapshot = store.secrets().to_vec();

        for secret in snapshot {
            if cancel.is_cancelled() {
                break;
            }
            outcome.checked += 1;

            let lookup = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = store.fetch_version_within(&secret.identifier, self.timeout) => result,
            };
            let version = match lookup {
                Ok(version) => version,
                Err(e) => {
                    warn!(identifier = %secret.identifier, "Error retrieving secret version: {e}");
                    outcome.failed += 1;
                    continue;
                }
            };

            if version == secret.version {
                continue;
            }
            outcome.drifted += 1;
            info!(
                identifier = %secret.identifier,
                from = %secret.version,
                to = %version,
                "Secret changed, re-materializing"
            );

            if cancel.is_cancelled() {
                break;
            }
            let identifier = secret.identifier.clone();
            match store.create_secret(secret).await {
                Ok(()) => outcome.rotated += 1,
                Err(e) => {
                    warn!(identifier = %identifier, "Error re-materializing secret: {e}");
                    outcome.failed += 1;
                }
            }
        }

        outcome
    }
}

/// Handle to a running watcher.
///
/// Dropping the handle cancels the task, but only [`stop`](Self::stop)
/// returns the store for cleanup.
#[derive(Debug)]
pub struct WatcherHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<SecretStore>>,
}

impl WatcherHandle {
    /// Cancel the polling task and take the store back.
    ///
    /// Returns `None` on every call after the first.
    pub async fn stop(&mut self) -> Option<SecretStore> {
        self.cancel.cancel();
        let task = self.task.take()?;
        match task.await {
            Ok(store) => Some(store),
            Err(e) => {
                error!("Rotation watcher task failed: {e}");
                None
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::env::MemoryEnvironment;
    use crate::secrets::providers::memory::MemorySource;
    use crate::secrets::Secret;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn setup(
        dir: &TempDir,
        secrets: &[(&str, &str, &str)],
    ) -> (SecretStore, Arc<MemorySource>) {
        let source = Arc::new(MemorySource::new());
        let mut store =
            SecretStore::new(source.clone(), Arc::new(MemoryEnvironment::new()), dir.path());
        for (id, name, value) in secrets {
            source.put(id, value.as_bytes(), "v1");
            store
                .create_secret(Secret::new(*id, *name, dir.path().join(name)))
                .await
                .unwrap();
        }
        (store, source)
    }

    fn watcher() -> RotationWatcher {
        RotationWatcher::new(Duration::from_millis(20), Duration::from_millis(200))
    }

    #[test]
    fn default_intervals() {
        let watcher = RotationWatcher::default();
        assert_eq!(watcher.frequency(), Duration::from_secs(15));
        assert_eq!(watcher.timeout(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn unchanged_versions_do_nothing() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("a", "A", "1")]).await;
        let fetches = source.value_fetches();

        let outcome = watcher().check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(
            outcome,
            PollOutcome {
                checked: 1,
                ..PollOutcome::default()
            }
        );
        assert_eq!(source.value_fetches(), fetches);
    }

    #[tokio::test]
    async fn drifted_secret_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("db", "DB", "pw123")]).await;
        source.put("db", b"pw456", "v2");

        let outcome = watcher().check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(outcome.drifted, 1);
        assert_eq!(outcome.rotated, 1);
        assert_eq!(std::fs::read(dir.path().join("DB")).unwrap(), b"pw456");
        assert_eq!(store.get("db").unwrap().version, "v2");
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn version_error_skips_secret_until_next_check() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("a", "A", "1"), ("b", "B", "2")]).await;
        source.put("a", b"1-new", "v2");
        source.put("b", b"2-new", "v2");
        source.fail_versions_for("a");

        let outcome = watcher().check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.rotated, 1);
        assert_eq!(std::fs::read(dir.path().join("A")).unwrap(), b"1");
        assert_eq!(store.get("a").unwrap().version, "v1");

        source.heal("a");
        let outcome = watcher().check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(outcome.rotated, 1);
        assert_eq!(std::fs::read(dir.path().join("A")).unwrap(), b"1-new");
    }

    #[tokio::test]
    async fn failed_rematerialization_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("a", "A", "old")]).await;
        source.put("a", b"new", "v2");
        source.fail_values_for("a");

        let outcome = watcher().check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(outcome.drifted, 1);
        assert_eq!(outcome.rotated, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(std::fs::read(dir.path().join("A")).unwrap(), b"old");
        assert_eq!(store.get("a").unwrap().version, "v1");
    }

    #[tokio::test]
    async fn slow_lookup_hits_deadline() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("a", "A", "1")]).await;
        source.set_latency(Duration::from_millis(500));

        let watcher = RotationWatcher::new(Duration::from_millis(20), Duration::from_millis(20));
        let outcome = watcher.check_once(&mut store, &CancellationToken::new()).await;
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.rotated, 0);
    }

    #[tokio::test]
    async fn cancelled_check_stops_early() {
        let dir = TempDir::new().unwrap();
        let (mut store, source) = setup(&dir, &[("a", "A", "1")]).await;
        let before = source.version_fetches();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = watcher().check_once(&mut store, &cancel).await;
        assert_eq!(outcome.checked, 0);
        assert_eq!(source.version_fetches(), before);
    }

    #[tokio::test]
    async fn rotations_in_one_tick_coalesce() {
        let dir = TempDir::new().unwrap();
        let (store, source) = setup(&dir, &[("a", "A", "1"), ("b", "B", "2")]).await;
        let (mut handle, mut rx) = watcher().start(store);

        source.put("a", b"1-new", "v2");
        source.put("b", b"2-new", "v2");

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.rotated, 2);

        // No further drift, so no further events.
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());

        let store = handle.stop().await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(std::fs::read(dir.path().join("A")).unwrap(), b"1-new");
        assert_eq!(std::fs::read(dir.path().join("B")).unwrap(), b"2-new");
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, _source) = setup(&dir, &[("a", "A", "1")]).await;
        let (mut handle, _rx) = watcher().start(store);
        assert!(handle.is_running());

        assert!(handle.stop().await.is_some());
        assert!(handle.stop().await.is_none());
        assert!(!handle.is_running());
    }

    #[tokio::test]
    async fn stop_unblocks_pending_send() {
        let dir = TempDir::new().unwrap();
        let (store, source) = setup(&dir, &[("a", "A", "1")]).await;
        let (mut handle, _rx) = watcher().start(store);

        // Two rotations with nobody receiving: the first fills the channel,
        // the second blocks the watcher in send.
        source.put("a", b"2", "v2");
        tokio::time::sleep(Duration::from_millis(100)).await;
        source.put("a", b"3", "v3");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let store = tokio::time::timeout(Duration::from_secs(2), handle.stop())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.get("a").unwrap().version, "v3");
    }
}
