use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

/// Termination requests addressed to secretary itself (Ctrl+C or SIGTERM).
pub struct TerminationSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

impl TerminationSignals {
    /// Install the handlers. Signals that arrive before the first
    /// [`recv`](Self::recv) are queued, not lost.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next termination request.
    pub async fn recv(&mut self) -> Signal {
        let received = tokio::select! {
            Some(()) = self.interrupt.recv() => Signal::SIGINT,
            Some(()) = self.terminate.recv() => Signal::SIGTERM,
            else => std::future::pending().await,
        };
        info!(signal = %received, "Received termination request");
        received
    }
}

/// Parse `SIGHUP`, `HUP` or `hup` into a signal.
pub fn parse_signal(name: &str) -> Option<Signal> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    full.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_signal_names() {
        assert_eq!(parse_signal("SIGHUP"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal("hup"), Some(Signal::SIGHUP));
        assert_eq!(parse_signal(" sigkill "), Some(Signal::SIGKILL));
        assert_eq!(parse_signal("TERM"), Some(Signal::SIGTERM));
        assert_eq!(parse_signal("SIGNOPE"), None);
        assert_eq!(parse_signal(""), None);
    }

    #[tokio::test]
    async fn receives_sigterm() {
        let mut signals = TerminationSignals::install().unwrap();
        nix::sys::signal::raise(Signal::SIGTERM).unwrap();
        let received = tokio::time::timeout(std::time::Duration::from_secs(2), signals.recv())
            .await
            .unwrap();
        assert_eq!(received, Signal::SIGTERM);
    }
}
