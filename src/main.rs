use clap::Parser;
use secretary::cli::Cli;
use secretary::config::{read_config_file, Config};
use secretary::logging;
use secretary::secrets::providers::build_source;
use secretary::secrets::{Environment, ProcessEnvironment, RotationWatcher, SecretStore};
use secretary::supervisor::{exit_code, ProcessSupervisor, SupervisorError, TerminationSignals};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = Config::locate(cli.config.as_deref())?;
    let mut config = match &config_path {
        Some(path) => read_config_file(path)?,
        None => Config::default(),
    };
    cli.apply_overrides(&mut config);
    config.validate()?;
    logging::init(&config.logging);
    match &config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("No config file found, using defaults"),
    }

    let reload_signal = config.reload_signal()?;
    let shutdown_signal = config.shutdown_signal()?;

    // Installed before any secret is written so a termination request
    // during setup still leads to cleanup.
    let mut signals = TerminationSignals::install()?;

    let env: Arc<dyn Environment> = Arc::new(ProcessEnvironment::new());
    let setup_cancel = CancellationToken::new();
    let mut store = SecretStore::new(
        build_source(&config),
        env.clone(),
        config.resolved_base_path(),
    )
    .with_prefix(config.env_prefix.clone())
    .with_fetch_timeout(config.poll_timeout())
    .with_cancellation(setup_cancel.clone());

    let (setup, interrupted) = {
        let materialize = store.materialize_from_environment(utf8_vars(env.as_ref()));
        tokio::pin!(materialize);
        let mut interrupted = None;
        loop {
            tokio::select! {
                result = &mut materialize => break (result, interrupted),
                received = signals.recv(), if interrupted.is_none() => {
                    // Let the in-flight secret settle so nothing is written
                    // after cleanup.
                    setup_cancel.cancel();
                    interrupted = Some(received);
                }
            }
        }
    };

    if let Some(received) = interrupted {
        info!(signal = %received, "Termination requested during setup");
        clean(&mut store);
        return Ok(ExitCode::SUCCESS);
    }
    if let Err(e) = setup {
        error!("Failed to materialize secrets: {e}");
        clean(&mut store);
        return Ok(ExitCode::FAILURE);
    }

    let supervisor = match ProcessSupervisor::spawn(&cli.command, env.as_ref()) {
        Ok(supervisor) => supervisor.with_signals(reload_signal, shutdown_signal),
        Err(e) => {
            error!("{e}");
            clean(&mut store);
            return Ok(ExitCode::FAILURE);
        }
    };

    let watcher = RotationWatcher::new(config.poll_frequency(), config.poll_timeout());
    let (mut watcher, changes) = watcher.start(store);

    let outcome = supervisor.run(changes, signals.recv()).await;

    if let Some(mut store) = watcher.stop().await {
        clean(&mut store);
    }

    let code = match outcome {
        Ok(report) => {
            info!(
                outcome = ?report.outcome,
                reloads = report.reloads_sent,
                "Supervisor finished"
            );
            ExitCode::SUCCESS
        }
        Err(SupervisorError::ChildFailed { status }) => {
            ExitCode::from(u8::try_from(exit_code(&status)).unwrap_or(1))
        }
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    };
    Ok(code)
}

/// Environment entries usable as declarations; non-UTF-8 entries are skipped.
fn utf8_vars(env: &dyn Environment) -> Vec<(String, String)> {
    env.vars()
        .into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                debug!(key = ?key, "Skipping non-UTF-8 environment entry");
                None
            }
        })
        .collect()
}

fn clean(store: &mut SecretStore) {
    if let Err(e) = store.clean() {
        error!("Failed to clean up secrets: {e}");
    }
}
