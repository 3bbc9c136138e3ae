mod defaults;
mod io;
mod types;
mod validation;

pub use defaults::*;
pub use io::*;
pub use types::*;
pub use validation::*;

use crate::supervisor::parse_signal;
use anyhow::{anyhow, bail, Result};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level secretary configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderKind,
    /// Directory secret files are written to. Defaults to the system temp dir.
    #[serde(default)]
    pub base_path: Option<PathBuf>,
    #[serde(default = "default_poll_frequency_ms")]
    pub poll_frequency_ms: u64,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
    #[serde(default = "default_reload_signal")]
    pub reload_signal: String,
    #[serde(default = "default_shutdown_signal")]
    pub shutdown_signal: String,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_poll_frequency_ms() -> u64 {
    DEFAULT_POLL_FREQUENCY_MS
}

fn default_poll_timeout_ms() -> u64 {
    DEFAULT_POLL_TIMEOUT_MS
}

fn default_env_prefix() -> String {
    DEFAULT_ENV_PREFIX.to_string()
}

fn default_reload_signal() -> String {
    DEFAULT_RELOAD_SIGNAL.to_string()
}

fn default_shutdown_signal() -> String {
    DEFAULT_SHUTDOWN_SIGNAL.to_string()
}

impl Config {
    /// Load configuration from an explicit file, a discovered file, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match Self::locate(path)? {
            Some(found) => read_config_file(&found),
            None => Ok(Config::default()),
        }
    }

    /// The file [`load`](Self::load) would read, if any.
    ///
    /// An explicit path that does not exist is an error; discovery falling
    /// through to defaults is not.
    pub fn locate(path: Option<&Path>) -> Result<Option<PathBuf>> {
        match path {
            Some(path) if !path.exists() => {
                bail!("Config file '{}' does not exist", path.display())
            }
            Some(path) => Ok(Some(path.to_path_buf())),
            None => Ok(find_config_file()),
        }
    }

    /// Check every field, failing with all problems listed.
    pub fn validate(&self) -> Result<()> {
        validate_config_object(self)
    }

    pub fn poll_frequency(&self) -> Duration {
        Duration::from_millis(self.poll_frequency_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Directory secret files are written to.
    pub fn resolved_base_path(&self) -> PathBuf {
        self.base_path.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn reload_signal(&self) -> Result<Signal> {
        parse_signal(&self.reload_signal)
            .ok_or_else(|| anyhow!("Unknown reload signal '{}'", self.reload_signal))
    }

    pub fn shutdown_signal(&self) -> Result<Signal> {
        parse_signal(&self.shutdown_signal)
            .ok_or_else(|| anyhow!("Unknown shutdown signal '{}'", self.shutdown_signal))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            base_path: None,
            poll_frequency_ms: DEFAULT_POLL_FREQUENCY_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            env_prefix: default_env_prefix(),
            reload_signal: default_reload_signal(),
            shutdown_signal: default_shutdown_signal(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Find the configuration file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    find_config_file_in(Path::new("."), dirs::home_dir().as_deref())
}

fn find_config_file_in(cwd: &Path, home: Option<&Path>) -> Option<PathBuf> {
    for ext in ["json", "yaml", "yml", "toml"] {
        let candidate = cwd.join(format!("{CONFIG_FILE_STEM}.{ext}"));
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let home_config = home?.join(CONFIG_HOME_DIR).join("config.json");
    home_config.exists().then_some(home_config)
}
