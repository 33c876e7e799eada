//! Command execution — runs a job's command and classifies the result.

pub mod shell;

use async_trait::async_trait;

use crate::error::ExecError;

pub use shell::ShellExecutor;

/// Failure message when a command exits non-zero without output.
pub const DEFAULT_FAILURE_MESSAGE: &str = "Command failed";

/// Failure message when the job exceeds its execution timeout.
pub const TIMEOUT_MESSAGE: &str = "Job execution timed out";

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the process was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Reason recorded on the job: stderr, else stdout, else a generic message.
    pub fn failure_message(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        DEFAULT_FAILURE_MESSAGE.to_string()
    }
}

/// How a job's execution ended, from the worker's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Success,
    Failure { message: String },
}

impl ExecutionOutcome {
    /// Classify an executor result.
    pub fn from_result(result: Result<CommandOutput, ExecError>) -> Self {
        match result {
            Ok(output) if output.success() => Self::Success,
            Ok(output) => Self::Failure {
                message: output.failure_message(),
            },
            Err(ExecError::Timeout(_)) => Self::Failure {
                message: TIMEOUT_MESSAGE.to_string(),
            },
            Err(e) => Self::execution_error(e),
        }
    }

    /// Failure caused by the executor itself rather than the command.
    pub fn execution_error(detail: impl std::fmt::Display) -> Self {
        Self::Failure {
            message: format!("Execution error: {detail}"),
        }
    }
}

/// Runs job commands. The worker owns one for its lifetime.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError>;
}
