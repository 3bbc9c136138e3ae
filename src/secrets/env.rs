//! Process environment as a side-effecting resource.
//!
//! The store publishes secret paths by setting environment variables. Going
//! through [`Environment`] keeps that I/O swappable: the binary uses the real
//! process environment, tests use [`MemoryEnvironment`].

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ffi::OsString;

/// Errors from environment mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvError {
    #[error("invalid environment variable name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid value for environment variable '{name}': contains NUL")]
    InvalidValue { name: String },
}

/// Read/write access to a set of environment variables.
pub trait Environment: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;

    fn set(&self, name: &str, value: &str) -> Result<(), EnvError>;

    fn unset(&self, name: &str) -> Result<(), EnvError>;

    /// Snapshot of every variable, in the form handed to child processes.
    fn vars(&self) -> Vec<(OsString, OsString)>;
}

/// Reject names and values the OS environment cannot hold.
///
/// `std::env::set_var` panics on these, so they are turned into errors first.
pub fn validate_var(name: &str, value: Option<&str>) -> Result<(), EnvError> {
    let reason = if name.is_empty() {
        Some("empty")
    } else if name.contains('=') {
        Some("contains '='")
    } else if name.contains('\0') {
        Some("contains NUL")
    } else {
        None
    };
    if let Some(reason) = reason {
        return Err(EnvError::InvalidName {
            name: name.to_string(),
            reason,
        });
    }
    if value.is_some_and(|v| v.contains('\0')) {
        return Err(EnvError::InvalidValue {
            name: name.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Process environment
// ============================================================================

/// The real environment of the current process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl ProcessEnvironment {
    pub fn new() -> Self {
        Self
    }
}

impl Environment for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn set(&self, name: &str, value: &str) -> Result<(), EnvError> {
        validate_var(name, Some(value))?;
        std::env::set_var(name, value);
        Ok(())
    }

    fn unset(&self, name: &str) -> Result<(), EnvError> {
        validate_var(name, None)?;
        std::env::remove_var(name);
        Ok(())
    }

    fn vars(&self) -> Vec<(OsString, OsString)> {
        std::env::vars_os().collect()
    }
}

// ============================================================================
// In-memory environment
// ============================================================================

/// An isolated environment map.
#[derive(Debug, Default)]
pub struct MemoryEnvironment {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from `(name, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            vars: Mutex::new(vars),
        }
    }

    /// Snapshot as UTF-8 pairs, ordered by name.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.vars
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.lock().contains_key(name)
    }
}

impl Environment for MemoryEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.lock().get(name).cloned()
    }

    fn set(&self, name: &str, value: &str) -> Result<(), EnvError> {
        validate_var(name, Some(value))?;
        self.vars.lock().insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn unset(&self, name: &str) -> Result<(), EnvError> {
        validate_var(name, None)?;
        self.vars.lock().remove(name);
        Ok(())
    }

    fn vars(&self) -> Vec<(OsString, OsString)> {
        self.vars
            .lock()
            .iter()
            .map(|(k, v)| (OsString::from(k), OsString::from(v)))
            .collect()
    }
}
