//! Shell executor for job commands.
//!
//! Provides controlled command execution with:
//! - Timeout enforcement (the child is killed when the timeout fires)
//! - Output capture and truncation

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::ExecError;
use crate::exec::{CommandExecutor, CommandOutput};

/// Maximum captured size per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Default job timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Runs commands through the platform shell (`sh -c` / `cmd /C`).
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    /// Working directory for commands (if None, inherits the worker's cwd).
    working_dir: Option<PathBuf>,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self {
            working_dir: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, cmd: &str) -> Command {
        let mut command = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", cmd]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", cmd]);
            c
        };

        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, cmd: &str) -> Result<CommandOutput, ExecError> {
        let child = self
            .build_command(cmd)
            .spawn()
            .map_err(|e| ExecError::Spawn(e.to_string()))?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(command = %truncate_for_log(cmd), timeout = ?self.timeout, "Command timed out");
                return Err(ExecError::Timeout(self.timeout));
            }
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

/// Truncate output to fit within limits (UTF-8 safe).
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

/// Truncate a command for log lines.
fn truncate_for_log(s: &str) -> String {
    if s.chars().count() <= 100 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(100).collect::<String>())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_command() {
        let output = ShellExecutor::new().execute("echo hello").await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let exec = ShellExecutor::new();
        assert!(exec.execute("true").await.unwrap().success());

        let output = exec.execute("exit 7").await.unwrap();
        assert_eq!(output.exit_code, 7);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn test_stderr_is_captured() {
        let output = ShellExecutor::new()
            .execute("echo oops >&2; exit 1")
            .await
            .unwrap();
        assert_eq!(output.failure_message(), "oops");
    }

    #[tokio::test]
    async fn test_timeout() {
        let exec = ShellExecutor::new().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();
        let err = exec.execute("sleep 5").await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_working_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let exec = ShellExecutor::new().with_working_dir(tmp.path().to_path_buf());
        let output = exec.execute("touch marker && ls").await.unwrap();
        assert!(output.stdout.contains("marker"));
        assert!(tmp.path().join("marker").exists());
    }

    #[test]
    fn test_truncate_output_is_char_safe() {
        let big = "é".repeat(MAX_OUTPUT_SIZE);
        let truncated = truncate_output(&big);
        assert!(truncated.contains("[truncated"));
        assert!(truncated.len() < big.len());

        assert_eq!(truncate_output("short"), "short");
    }

    #[test]
    fn test_truncate_for_log() {
        assert_eq!(truncate_for_log("ls"), "ls");
        let long = "x".repeat(150);
        assert_eq!(truncate_for_log(&long).chars().count(), 103);
    }
}
