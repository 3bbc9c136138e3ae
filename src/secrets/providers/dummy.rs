//! Stand-in source for trying secretary without a backend.
//!
//! Every identifier resolves to the same value. Each version lookup has a
//! one-in-five chance of bumping the version, which exercises rotation.

use crate::secrets::{SecretSource, SourceError};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

/// Value returned for every identifier.
pub const DUMMY_SECRET_VALUE: &[u8] = b"dummy-secret-value";

pub struct DummySource {
    version: AtomicU64,
    /// Probability that a version lookup bumps the version.
    bump_probability: f64,
}

impl DummySource {
    pub fn new() -> Self {
        Self::with_bump_probability(0.2)
    }

    /// `0.0` never rotates, `1.0` rotates on every lookup.
    pub fn with_bump_probability(p: f64) -> Self {
        Self {
            version: AtomicU64::new(0),
            bump_probability: p.clamp(0.0, 1.0),
        }
    }
}

impl Default for DummySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecretSource for DummySource {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn get_value(&self, _identifier: &str) -> Result<Vec<u8>, SourceError> {
        Ok(DUMMY_SECRET_VALUE.to_vec())
    }

    async fn get_version(&self, _identifier: &str) -> Result<String, SourceError> {
        let version = if rand::thread_rng().gen_bool(self.bump_probability) {
            self.version.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.version.load(Ordering::Relaxed)
        };
        Ok(format!("v{version}"))
    }
}
