//! External command secret source.
//!
//! The identifier is a command line. Its stdout is the secret value, and the
//! SHA-256 of stdout is the version, so a command whose output changes is
//! picked up as a rotation.

use crate::secrets::{content_version, SecretSource, SourceError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tracing::warn;

/// Maximum output size from a secret command (1 MB).
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Stderr kept for error messages.
const MAX_STDERR_BYTES: u64 = 4096;

/// Resolves secrets by executing external commands.
pub struct ExecSource {
    /// Working directory for command execution.
    cwd: Option<PathBuf>,
}

impl ExecSource {
    pub fn new(cwd: Option<PathBuf>) -> Self {
        Self { cwd }
    }

    async fn run(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        // Explicit arg splitting, no shell interpretation.
        let parts: Vec<&str> = identifier.split_whitespace().collect();
        let Some((program, args)) = parts.split_first() else {
            return Err(SourceError::Rejected {
                identifier: identifier.to_string(),
                reason: "empty command".to_string(),
            });
        };

        if is_dangerous_command(program) {
            return Err(SourceError::Rejected {
                identifier: identifier.to_string(),
                reason: format!("command '{program}' is not allowed for secret resolution"),
            });
        }

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // The caller's deadline drops this future; take the process with it.
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn()?;
        let (Some(mut stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(SourceError::Failed(format!(
                "command '{program}' output was not captured"
            )));
        };
        let stderr_task = tokio::spawn(drain_stderr(stderr));

        // One byte past the cap is enough to tell the output is too large.
        let mut output = Vec::new();
        (&mut stdout)
            .take(MAX_OUTPUT_BYTES as u64 + 1)
            .read_to_end(&mut output)
            .await?;
        if output.len() > MAX_OUTPUT_BYTES {
            let _ = child.kill().await;
            stderr_task.abort();
            return Err(SourceError::Failed(format!(
                "command '{program}' output exceeds {MAX_OUTPUT_BYTES} bytes"
            )));
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            warn!(
                program = %program,
                status = %status,
                "Secret command failed: {}",
                stderr.trim()
            );
            return Err(SourceError::Failed(format!(
                "command '{program}' exited with status {status}: {}",
                stderr.trim()
            )));
        }

        if output.is_empty() {
            return Err(SourceError::NotFound(identifier.to_string()));
        }

        Ok(output)
    }
}

/// Keep the first [`MAX_STDERR_BYTES`] of stderr and discard the rest, so a
/// chatty command never blocks on a full pipe.
async fn drain_stderr(mut stderr: ChildStderr) -> Vec<u8> {
    let mut kept = Vec::new();
    let _ = (&mut stderr)
        .take(MAX_STDERR_BYTES)
        .read_to_end(&mut kept)
        .await;
    let _ = tokio::io::copy(&mut stderr, &mut tokio::io::sink()).await;
    kept
}

#[async_trait]
impl SecretSource for ExecSource {
    fn name(&self) -> &str {
        "exec"
    }

    async fn get_value(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        self.run(identifier).await
    }

    async fn get_version(&self, identifier: &str) -> Result<String, SourceError> {
        let output = self.run(identifier).await?;
        Ok(content_version(&output))
    }
}

/// Check if a command is too dangerous for secret resolution.
fn is_dangerous_command(program: &str) -> bool {
    let basename = program.rsplit('/').next().unwrap_or(program);

    matches!(
        basename,
        "rm" | "rmdir" | "mkfs" | "dd" | "shutdown" | "reboot"
            | "halt" | "poweroff" | "kill" | "killall" | "pkill"
            | "format" | "fdisk" | "parted"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn value_is_raw_stdout() {
        let source = ExecSource::new(None);
        let value = source.get_value("echo hello-secret").await.unwrap();
        assert_eq!(value, b"hello-secret\n");
    }

    #[tokio::test]
    async fn version_is_stable_for_same_output() {
        let source = ExecSource::new(None);
        let v1 = source.get_version("echo one").await.unwrap();
        let v2 = source.get_version("echo one").await.unwrap();
        let v3 = source.get_version("echo two").await.unwrap();
        assert_eq!(v1, v2);
        assert_ne!(v1, v3);
    }

    #[tokio::test]
    async fn failing_command_errors() {
        let source = ExecSource::new(None);
        assert!(matches!(
            source.get_value("false").await,
            Err(SourceError::Failed(_))
        ));
    }

    #[tokio::test]
    async fn empty_output_is_not_found() {
        let source = ExecSource::new(None);
        assert!(matches!(
            source.get_value("true").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn oversized_output_is_cut_off() {
        let source = ExecSource::new(None);
        let err = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            source.get_value("head -c 5000000 /dev/zero"),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn output_at_limit_is_accepted() {
        let source = ExecSource::new(None);
        let value = source
            .get_value(&format!("head -c {MAX_OUTPUT_BYTES} /dev/zero"))
            .await
            .unwrap();
        assert_eq!(value.len(), MAX_OUTPUT_BYTES);
    }

    #[tokio::test]
    async fn reject_dangerous_command() {
        let source = ExecSource::new(None);
        let err = source.get_value("rm -rf /").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let source = ExecSource::new(None);
        assert!(matches!(
            source.get_version("").await,
            Err(SourceError::Rejected { .. })
        ));
    }

    #[tokio::test]
    async fn runs_in_working_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("token"), b"abc").unwrap();
        let source = ExecSource::new(Some(dir.path().to_path_buf()));
        assert_eq!(source.get_value("cat token").await.unwrap(), b"abc");
    }

    #[test]
    fn dangerous_command_detection() {
        assert!(is_dangerous_command("rm"));
        assert!(is_dangerous_command("/bin/rm"));
        assert!(is_dangerous_command("kill"));
        assert!(!is_dangerous_command("echo"));
        assert!(!is_dangerous_command("vault"));
        assert!(!is_dangerous_command("aws"));
    }
}
