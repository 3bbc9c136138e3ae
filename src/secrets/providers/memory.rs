//! In-process secret source with fault injection, for tests and embedding.

use crate::secrets::{SecretSource, SourceError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    version: String,
}

#[derive(Debug, Default)]
pub struct MemorySource {
    entries: Mutex<HashMap<String, Entry>>,
    failing_versions: Mutex<HashSet<String>>,
    failing_values: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    version_fetches: AtomicUsize,
    value_fetches: AtomicUsize,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a secret.
    pub fn put(&self, identifier: &str, value: &[u8], version: &str) {
        self.entries.lock().insert(
            identifier.to_string(),
            Entry {
                value: value.to_vec(),
                version: version.to_string(),
            },
        );
    }

    pub fn remove(&self, identifier: &str) {
        self.entries.lock().remove(identifier);
    }

    /// Make version lookups for `identifier` fail until [`heal`](Self::heal).
    pub fn fail_versions_for(&self, identifier: &str) {
        self.failing_versions.lock().insert(identifier.to_string());
    }

    /// Make value fetches for `identifier` fail until [`heal`](Self::heal).
    pub fn fail_values_for(&self, identifier: &str) {
        self.failing_values.lock().insert(identifier.to_string());
    }

    pub fn heal(&self, identifier: &str) {
        self.failing_versions.lock().remove(identifier);
        self.failing_values.lock().remove(identifier);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    pub fn version_fetches(&self) -> usize {
        self.version_fetches.load(Ordering::SeqCst)
    }

    pub fn value_fetches(&self) -> usize {
        self.value_fetches.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn entry(&self, identifier: &str) -> Result<Entry, SourceError> {
        self.entries
            .lock()
            .get(identifier)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(identifier.to_string()))
    }
}

#[async_trait]
impl SecretSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get_value(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        self.value_fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.failing_values.lock().contains(identifier) {
            return Err(SourceError::Failed(format!("injected value failure for '{identifier}'")));
        }
        Ok(self.entry(identifier)?.value)
    }

    async fn get_version(&self, identifier: &str) -> Result<String, SourceError> {
        self.version_fetches.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        if self.failing_versions.lock().contains(identifier) {
            return Err(SourceError::Failed(format!("injected version failure for '{identifier}'")));
        }
        Ok(self.entry(identifier)?.version)
    }
}
