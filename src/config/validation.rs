use super::Config;
use crate::supervisor::parse_signal;
use anyhow::Result;
use nix::sys::signal::Signal;
use tracing::warn;

/// Validation errors for configuration.
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn error(path: &str, message: impl Into<String>) -> ConfigValidationError {
    ConfigValidationError {
        path: path.to_string(),
        message: message.into(),
    }
}

/// Validate a configuration object.
pub fn validate_config(config: &Config) -> Vec<ConfigValidationError> {
    let mut errors = Vec::new();

    if config.poll_frequency_ms == 0 {
        errors.push(error("pollFrequencyMs", "Poll frequency must be greater than 0"));
    }
    if config.poll_timeout_ms == 0 {
        errors.push(error("pollTimeoutMs", "Poll timeout must be greater than 0"));
    }
    if config.poll_timeout_ms > config.poll_frequency_ms && config.poll_frequency_ms > 0 {
        warn!(
            timeout_ms = config.poll_timeout_ms,
            frequency_ms = config.poll_frequency_ms,
            "Poll timeout exceeds poll frequency; slow checks will delay the next one"
        );
    }

    if config.env_prefix.is_empty() {
        errors.push(error("envPrefix", "Prefix must not be empty"));
    } else if config.env_prefix.contains('=') || config.env_prefix.contains('\0') {
        errors.push(error("envPrefix", "Prefix must not contain '=' or NUL"));
    }

    if let Some(base) = &config.base_path {
        if base.as_os_str().is_empty() {
            errors.push(error("basePath", "Base path must not be empty"));
        } else if base.to_str().is_none() {
            errors.push(error("basePath", "Base path must be valid UTF-8"));
        }
    }

    match parse_signal(&config.reload_signal) {
        None => errors.push(error(
            "reloadSignal",
            format!("Unknown signal '{}'", config.reload_signal),
        )),
        Some(Signal::SIGKILL) | Some(Signal::SIGSTOP) => errors.push(error(
            "reloadSignal",
            "Reload signal must be one the child can handle",
        )),
        Some(_) => {}
    }
    if parse_signal(&config.shutdown_signal).is_none() {
        errors.push(error(
            "shutdownSignal",
            format!("Unknown signal '{}'", config.shutdown_signal),
        ));
    }

    errors
}

/// Validate configuration and return Result.
pub fn validate_config_object(config: &Config) -> Result<()> {
    let errors = validate_config(config);
    if errors.is_empty() {
        Ok(())
    } else {
        let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        anyhow::bail!("Configuration validation failed:\n{}", messages.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn paths(config: &Config) -> Vec<String> {
        validate_config(config).into_iter().map(|e| e.path).collect()
    }

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&Config::default()).is_empty());
    }

    #[test]
    fn zero_durations_rejected() {
        let config = Config {
            poll_frequency_ms: 0,
            poll_timeout_ms: 0,
            ..Config::default()
        };
        assert_eq!(paths(&config), vec!["pollFrequencyMs", "pollTimeoutMs"]);
    }

    #[test]
    fn bad_prefix_rejected() {
        let empty = Config {
            env_prefix: String::new(),
            ..Config::default()
        };
        assert_eq!(paths(&empty), vec!["envPrefix"]);

        let equals = Config {
            env_prefix: "A=B".into(),
            ..Config::default()
        };
        assert_eq!(paths(&equals), vec!["envPrefix"]);
    }

    #[test]
    fn bad_signals_rejected() {
        let config = Config {
            reload_signal: "SIGKILL".into(),
            shutdown_signal: "SIGNOPE".into(),
            ..Config::default()
        };
        assert_eq!(paths(&config), vec!["reloadSignal", "shutdownSignal"]);
    }

    #[test]
    fn validate_object_joins_messages() {
        let config = Config {
            poll_frequency_ms: 0,
            ..Config::default()
        };
        let err = validate_config_object(&config).unwrap_err();
        assert!(err.to_string().contains("pollFrequencyMs: Poll frequency"));
    }
}
