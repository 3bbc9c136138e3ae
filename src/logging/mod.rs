use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install the global subscriber.
///
/// `RUST_LOG` is honoured; the configured level applies to secretary's own
/// targets. Output goes to stderr so the child keeps stdout to itself.
pub fn init(config: &LoggingConfig) {
    let filter = build_filter(config);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    // A subscriber may already be installed when embedded or under test.
    if config.json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    let filter = EnvFilter::from_default_env();
    match format!("secretary={}", config.level.as_filter()).parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}
