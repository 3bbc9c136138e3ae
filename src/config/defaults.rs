/// Default configuration constants used across the system.

/// Prefix marking an environment variable as a secret declaration.
pub const DEFAULT_ENV_PREFIX: &str = "SECRETARY_";

/// Default interval between rotation checks (15 seconds).
pub const DEFAULT_POLL_FREQUENCY_MS: u64 = 15_000;

/// Default deadline for a single fetch from the source (10 seconds).
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10_000;

/// Signal relayed to the child when a secret rotates.
pub const DEFAULT_RELOAD_SIGNAL: &str = "SIGHUP";

/// Signal relayed to the child when secretary is asked to stop.
pub const DEFAULT_SHUTDOWN_SIGNAL: &str = "SIGKILL";

/// File stem searched for in the working directory.
pub const CONFIG_FILE_STEM: &str = "secretary";

/// Directory under `$HOME` holding the fallback `config.json`.
pub const CONFIG_HOME_DIR: &str = ".secretary";
