//! Child process supervision.
//!
//! [`ProcessSupervisor`] owns exactly one child. Its control loop waits on
//! three sources at once and services whichever is ready first:
//!
//! - child exit: stop and return the child's outcome
//! - termination request: relay the shutdown signal, stop, return success
//! - rotation event: relay the reload signal and keep running
//!
//! The loop returns on the first terminal event, so exactly one teardown path
//! runs. Cleaning up secrets and stopping the watcher is left to the caller.

mod signals;

pub use signals::{parse_signal, TerminationSignals};

use crate::secrets::{Environment, RotationEvent};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// How long to wait for the child to be reaped after the shutdown signal.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("no command given")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("child process has no pid")]
    MissingPid,

    #[error("failed to send {signal} to pid {pid}: {source}")]
    Signal {
        pid: i32,
        signal: Signal,
        #[source]
        source: Errno,
    },

    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("child process exited abnormally: {status}")]
    ChildFailed { status: ExitStatus },
}

/// How the control loop reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stopped {
    /// A termination request arrived; `sent` was relayed to the child.
    Terminated { received: Signal, sent: Signal },
    /// The child exited on its own with a success status.
    Exited { status: ExitStatus },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorReport {
    pub outcome: Stopped,
    /// Reload signals delivered while running.
    pub reloads_sent: usize,
}

/// A running child process.
///
/// The child is only reaped by the control loop itself, so its pid stays
/// valid for signalling until the loop has seen it exit.
#[derive(Debug)]
pub struct ProcessSupervisor {
    program: String,
    pid: i32,
    child: Child,
    reload_signal: Signal,
    shutdown_signal: Signal,
}

impl ProcessSupervisor {
    /// Start `command` with inherited stdio and the variables in `env`.
    pub fn spawn(command: &[String], env: &dyn Environment) -> Result<Self, SupervisorError> {
        let (program, args) = command.split_first().ok_or(SupervisorError::EmptyCommand)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(env.vars())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            program: program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .ok_or(SupervisorError::MissingPid)?;

        info!(pid, program = %program, "Started child process");
        Ok(Self {
            program: program.clone(),
            pid,
            child,
            reload_signal: Signal::SIGHUP,
            shutdown_signal: Signal::SIGKILL,
        })
    }

    /// Override the signals relayed on rotation and on shutdown.
    pub fn with_signals(mut self, reload: Signal, shutdown: Signal) -> Self {
        self.reload_signal = reload;
        self.shutdown_signal = shutdown;
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Run the control loop until the child exits or `shutdown` resolves.
    ///
    /// When several sources are ready at once, child exit wins over a
    /// termination request, which wins over a pending rotation event, so a
    /// signal is never relayed to a child already known to be gone.
    pub async fn run<F>(
        self,
        mut changes: mpsc::Receiver<RotationEvent>,
        shutdown: F,
    ) -> Result<SupervisorReport, SupervisorError>
    where
        F: Future<Output = Signal>,
    {
        let Self {
            program,
            pid,
            mut child,
            reload_signal,
            shutdown_signal,
        } = self;
        tokio::pin!(shutdown);

        let mut changes_open = true;
        let mut reloads_sent = 0;

        loop {
            tokio::select! {
                biased;

                status = child.wait() => {
                    let status = status.map_err(SupervisorError::Wait)?;
                    info!(pid, program = %program, %status, "Child process exited");
                    if !status.success() {
                        return Err(SupervisorError::ChildFailed { status });
                    }
                    return Ok(SupervisorReport {
                        outcome: Stopped::Exited { status },
                        reloads_sent,
                    });
                }

                received = &mut shutdown => {
                    info!(
                        pid,
                        received = %received,
                        sending = %shutdown_signal,
                        "Stopping child process"
                    );
                    deliver(&mut child, shutdown_signal)?;
                    reap(&mut child).await;
                    return Ok(SupervisorReport {
                        outcome: Stopped::Terminated {
                            received,
                            sent: shutdown_signal,
                        },
                        reloads_sent,
                    });
                }

                event = changes.recv(), if changes_open => match event {
                    Some(event) => {
                        info!(
                            pid,
                            signal = %reload_signal,
                            rotated = event.rotated,
                            at = %event.at,
                            "Secrets changed, signalling child"
                        );
                        if let Err(e) = deliver(&mut child, reload_signal) {
                            stop_child(&mut child, shutdown_signal).await;
                            return Err(e);
                        }
                        reloads_sent += 1;
                    }
                    None => {
                        debug!("Rotation channel closed");
                        changes_open = false;
                    }
                },
            }
        }
    }
}

/// Send `signal` to the child unless it has already exited.
///
/// An exited child is left for the control loop to reap, so its status is
/// still reported.
fn deliver(child: &mut Child, signal: Signal) -> Result<(), SupervisorError> {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        debug!(%signal, "Child process already reaped, not signalling");
        return Ok(());
    };
    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => {
            debug!(pid, %signal, "Child process already gone");
            Ok(())
        }
        Err(source) => Err(SupervisorError::Signal {
            pid,
            signal,
            source,
        }),
    }
}

/// Best-effort stop used when the loop must bail out with the child alive.
async fn stop_child(child: &mut Child, signal: Signal) {
    if let Err(e) = deliver(child, signal) {
        warn!("Failed to stop child process: {e}");
        if let Err(e) = child.start_kill() {
            warn!("Failed to kill child process: {e}");
        }
    }
    reap(child).await;
}

/// Give the child a bounded chance to exit after the shutdown signal so it
/// does not outlive the supervisor as a zombie.
async fn reap(child: &mut Child) {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "Child process reaped"),
        Ok(Err(e)) => warn!("Failed to reap child process: {e}"),
        Err(_) => warn!(
            "Child process still running {}s after shutdown signal",
            REAP_TIMEOUT.as_secs()
        ),
    }
}

/// Exit code secretary should report for a child's exit status.
///
/// A child killed by signal `N` maps to `128 + N`, as shells do.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}
