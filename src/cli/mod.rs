use crate::config::{Config, LoggingLevel, ProviderKind};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "secretary",
    version,
    about = "Run a command with secrets materialized as files and kept up to date"
)]
pub struct Cli {
    /// Configuration file (json, json5, yaml or toml).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Secret source: dummy, exec or file.
    #[arg(long)]
    pub provider: Option<ProviderKind>,

    /// Directory secret files are written to.
    #[arg(short, long)]
    pub path: Option<PathBuf>,

    /// Interval between rotation checks, e.g. `15s` or `500ms`.
    #[arg(short, long, value_parser = parse_duration)]
    pub frequency: Option<Duration>,

    /// Deadline for each fetch from the source.
    #[arg(short, long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    #[arg(long)]
    pub log_level: Option<LoggingLevel>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub log_json: bool,

    /// The command to supervise, with its arguments.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    /// Overlay flags given on the command line onto `config`.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(provider) = self.provider {
            config.provider = provider;
        }
        if let Some(path) = &self.path {
            config.base_path = Some(path.clone());
        }
        if let Some(frequency) = self.frequency {
            config.poll_frequency_ms = duration_ms(frequency);
        }
        if let Some(timeout) = self.timeout {
            config.poll_timeout_ms = duration_ms(timeout);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.json = true;
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Parse `500ms`, `15s`, `2m`, `1h`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {input:?}"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(3600)),
        _ => return Err(format!("invalid duration unit in {input:?} (use ms, s, m or h)")),
    };
    Ok(duration)
}
