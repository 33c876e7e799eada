//! Worker pool supervisor — launches, tracks, and stops worker processes.
//!
//! Workers are separate OS processes that outlive the CLI invocation that
//! started them. Their PIDs are persisted so a later invocation can stop
//! them or count the live ones.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ENV_DATA_DIR, QueueConfig};
use crate::error::SupervisorError;
use crate::worker::pidfile::PidFile;
use crate::worker::process::{self, SignalResult};

/// Grace period for workers spawned by this supervisor instance.
const CHILD_GRACE: Duration = Duration::from_secs(5);

/// Grace period for workers known only from the PID file.
const RECORDED_GRACE: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How to launch one worker process.
#[derive(Debug, Clone)]
pub struct WorkerLauncher {
    program: PathBuf,
    args: Vec<String>,
    /// Flag that passes the worker id, appended after `args`.
    id_flag: Option<String>,
}

impl WorkerLauncher {
    /// This executable, running `worker run --id <worker-id>`.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program =
            std::env::current_exe().map_err(|e| SupervisorError::Executable(e.to_string()))?;
        Ok(Self::jobqueue_binary(program))
    }

    /// A `jobqueue` binary at the given path, running `worker run --id <worker-id>`.
    pub fn jobqueue_binary(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: vec!["worker".to_string(), "run".to_string()],
            id_flag: Some("--id".to_string()),
        }
    }

    /// An arbitrary program; the worker id is not passed.
    pub fn command<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            id_flag: None,
        }
    }

    fn build(&self, worker_id: &str, config: &QueueConfig) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(flag) = &self.id_flag {
            cmd.arg(flag).arg(worker_id);
        }
        cmd.env(ENV_DATA_DIR, &config.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group, so a Ctrl-C on the launching terminal does not
        // reach the workers.
        #[cfg(unix)]
        cmd.process_group(0);

        cmd
    }
}

/// Summary of a `stop` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Exited within the grace period.
    pub stopped: usize,
    /// Killed after the grace period.
    pub forced: usize,
    /// Recorded but already gone.
    pub not_running: usize,
    pub warnings: Vec<String>,
}

impl StopReport {
    fn warn(&mut self, message: String) {
        warn!("{message}");
        self.warnings.push(message);
    }
}

struct SpawnedWorker {
    worker_id: String,
    pid: u32,
    child: Child,
}

/// Manages the worker processes for one data directory.
pub struct Supervisor {
    config: QueueConfig,
    launcher: WorkerLauncher,
    pid_file: PidFile,
    children: Mutex<Vec<SpawnedWorker>>,
}

impl Supervisor {
    pub fn new(config: QueueConfig, launcher: WorkerLauncher) -> Self {
        let pid_file = PidFile::new(config.pid_file());
        Self {
            config,
            launcher,
            pid_file,
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    /// Stop any recorded workers, then launch `count` new ones.
    ///
    /// Returns the new PIDs, which are also written to the PID file.
    pub async fn start(&self, count: usize) -> Result<Vec<u32>, SupervisorError> {
        let previous = self.stop().await;
        if previous.stopped + previous.forced > 0 {
            info!(
                stopped = previous.stopped,
                forced = previous.forced,
                "Stopped previously running workers"
            );
        }

        let mut children = self.children.lock().await;
        let mut pids = Vec::with_capacity(count);
        let supervisor_pid = std::process::id();

        for index in 1..=count {
            let worker_id = format!("worker-{supervisor_pid}-{index}");
            let spawned = self
                .launcher
                .build(&worker_id, &self.config)
                .spawn()
                .map_err(|e| e.to_string())
                .and_then(|child| match child.id() {
                    Some(pid) => Ok((child, pid)),
                    None => Err("process exited before its PID was read".to_string()),
                });

            match spawned {
                Ok((child, pid)) => {
                    info!(worker_id = %worker_id, pid, "Worker process started");
                    pids.push(pid);
                    children.push(SpawnedWorker {
                        worker_id,
                        pid,
                        child,
                    });
                }
                Err(reason) => {
                    // Record what did start so a later stop can find it.
                    self.pid_file.save(&pids)?;
                    return Err(SupervisorError::SpawnFailed { worker_id, reason });
                }
            }
        }

        self.pid_file.save(&pids)?;
        Ok(pids)
    }

    /// Stop every worker this supervisor spawned or finds in the PID file,
    /// then clear the PID file. Problems are reported, never returned.
    pub async fn stop(&self) -> StopReport {
        let mut report = StopReport::default();

        let spawned: Vec<SpawnedWorker> = self.children.lock().await.drain(..).collect();
        let spawned_pids: HashSet<u32> = spawned.iter().map(|w| w.pid).collect();

        for worker in spawned {
            stop_spawned(worker, &mut report).await;
        }

        let recorded = match self.pid_file.load() {
            Ok(pids) => pids,
            Err(e) => {
                report.warn(format!(
                    "Failed to read PID file {}: {e}",
                    self.pid_file.path().display()
                ));
                Vec::new()
            }
        };
        for pid in recorded.into_iter().filter(|pid| !spawned_pids.contains(pid)) {
            stop_recorded(pid, &mut report).await;
        }

        if let Err(e) = self.pid_file.clear() {
            report.warn(format!(
                "Failed to clear PID file {}: {e}",
                self.pid_file.path().display()
            ));
        }
        report
    }

    /// Number of recorded workers that are still running and ours to signal.
    /// A PID we may not signal is not one of our workers.
    pub fn active_count(&self) -> usize {
        match self.pid_file.load() {
            Ok(pids) => pids
                .into_iter()
                .filter(|pid| process::check(*pid) == SignalResult::Sent)
                .count(),
            Err(e) => {
                warn!(error = %e, "Failed to read PID file");
                0
            }
        }
    }
}

/// SIGTERM, wait up to [`CHILD_GRACE`], then kill.
async fn stop_spawned(mut worker: SpawnedWorker, report: &mut StopReport) {
    if let Ok(Some(status)) = worker.child.try_wait() {
        debug!(worker_id = %worker.worker_id, %status, "Worker already exited");
        report.not_running += 1;
        return;
    }

    match process::terminate(worker.pid) {
        SignalResult::Sent => {}
        SignalResult::NotFound => {
            report.not_running += 1;
            return;
        }
        other => report.warn(format!(
            "Failed to signal worker {} (pid {}): {other:?}",
            worker.worker_id, worker.pid
        )),
    }

    let deadline = tokio::time::Instant::now() + CHILD_GRACE;
    while tokio::time::Instant::now() < deadline {
        match worker.child.try_wait() {
            Ok(Some(_)) => {
                info!(worker_id = %worker.worker_id, pid = worker.pid, "Worker stopped");
                report.stopped += 1;
                return;
            }
            Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
            Err(e) => {
                report.warn(format!("Failed to poll worker {}: {e}", worker.worker_id));
                break;
            }
        }
    }

    match worker.child.kill().await {
        Ok(()) => {
            warn!(worker_id = %worker.worker_id, pid = worker.pid, "Worker killed after grace period");
            report.forced += 1;
        }
        Err(e) => report.warn(format!("Failed to kill worker {}: {e}", worker.worker_id)),
    }
}

/// SIGTERM, wait up to [`RECORDED_GRACE`], then SIGKILL.
async fn stop_recorded(pid: u32, report: &mut StopReport) {
    match process::terminate(pid) {
        SignalResult::Sent => {}
        SignalResult::NotFound => {
            debug!(pid, "Recorded worker not running");
            report.not_running += 1;
            return;
        }
        SignalResult::PermissionDenied => {
            report.warn(format!("No permission to stop process {pid}"));
            return;
        }
        SignalResult::Failed(e) => {
            report.warn(format!("Failed to signal process {pid}: {e}"));
            return;
        }
    }

    let deadline = tokio::time::Instant::now() + RECORDED_GRACE;
    while tokio::time::Instant::now() < deadline {
        if !process::is_alive(pid) {
            info!(pid, "Worker stopped");
            report.stopped += 1;
            return;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }

    match process::kill(pid) {
        SignalResult::Sent => {
            warn!(pid, "Worker killed after grace period");
            report.forced += 1;
        }
        SignalResult::NotFound => report.stopped += 1,
        other => report.warn(format!("Failed to kill process {pid}: {other:?}")),
    }
}
