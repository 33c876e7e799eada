//! Worker execution loop.
//!
//! One worker runs one job at a time: claim, execute, report, release.
//! Workers coordinate only through the store; several may run in separate
//! processes against the same database file.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{ExecError, JobError};
use crate::exec::{CommandExecutor, CommandOutput, ExecutionOutcome};
use crate::job::{Job, JobState, RetryPolicy};
use crate::store::JobStore;

/// Where the worker is in its cycle. Logged on every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Executing,
    Reporting,
    Stopped,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Claiming => "claiming",
            Self::Executing => "executing",
            Self::Reporting => "reporting",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Result of a single claim/execute/report cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was claimable.
    Idle,
    Completed,
    /// Failed with retry budget left; a retry is scheduled.
    Retrying,
    /// Failed for the last time; moved to the dead letter queue.
    Dead,
    /// Shutdown arrived mid-execution and another worker reclaimed the job,
    /// so this worker's result was discarded.
    Abandoned,
}

/// Dependencies shared by every cycle.
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub executor: Arc<dyn CommandExecutor>,
    pub policy: RetryPolicy,
    pub config: WorkerConfig,
}

/// A job worker bound to one id and one shutdown signal.
pub struct Worker {
    id: String,
    deps: WorkerDeps,
    shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub fn new(id: impl Into<String>, deps: WorkerDeps, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            id: id.into(),
            deps,
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn enter(&self, phase: WorkerPhase) {
        debug!(worker_id = %self.id, phase = %phase, "Worker phase");
    }

    /// Run cycles until shutdown is signalled.
    ///
    /// Store errors never end the loop: they are logged, the lease is
    /// released, and the worker pauses before trying again.
    pub async fn run(&self) {
        info!(worker_id = %self.id, "Worker started");

        while !self.shutdown_requested() {
            match self.run_once().await {
                Ok(CycleOutcome::Idle) => {
                    self.enter(WorkerPhase::Idle);
                    self.pause(self.deps.config.idle_interval).await;
                }
                Ok(outcome) => {
                    debug!(worker_id = %self.id, outcome = ?outcome, "Cycle finished");
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Worker cycle failed");
                    self.pause(self.deps.config.error_pause).await;
                }
            }
        }

        self.enter(WorkerPhase::Stopped);
        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Claim one job, execute it, and persist the outcome.
    ///
    /// The lease is released on every path after a successful claim.
    pub async fn run_once(&self) -> Result<CycleOutcome, JobError> {
        self.enter(WorkerPhase::Claiming);
        let Some(job) = self.deps.store.acquire(&self.id).await? else {
            return Ok(CycleOutcome::Idle);
        };

        let job_id = job.id.clone();
        let mut lease_released = false;
        let result = self.process(job, &mut lease_released).await;

        if !lease_released {
            if let Err(e) = self.deps.store.release(&job_id).await {
                warn!(worker_id = %self.id, job_id = %job_id, error = %e, "Failed to release lease");
            }
        }
        self.enter(WorkerPhase::Idle);
        result
    }

    async fn process(
        &self,
        mut job: Job,
        lease_released: &mut bool,
    ) -> Result<CycleOutcome, JobError> {
        self.enter(WorkerPhase::Executing);
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            attempt = job.attempts + 1,
            command = %job.command,
            "Executing job"
        );

        let command = job.command.clone();
        let execution = AssertUnwindSafe(self.deps.executor.execute(&command)).catch_unwind();
        tokio::pin!(execution);

        let mut shutdown = self.shutdown.clone();
        let outcome = tokio::select! {
            result = &mut execution => classify(result),
            _ = wait_for_shutdown(&mut shutdown) => {
                info!(worker_id = %self.id, job_id = %job.id, "Shutdown requested mid-execution, releasing lease");
                match self.deps.store.release(&job.id).await {
                    Ok(()) => *lease_released = true,
                    Err(e) => warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        error = %e,
                        "Failed to release lease, holding it until the command exits"
                    ),
                }

                // The command is never cut short by shutdown.
                let outcome = classify(execution.await);
                if *lease_released {
                    return self.report_after_shutdown(&job.id, outcome).await;
                }
                outcome
            }
        };

        self.report(&mut job, outcome).await
    }

    /// Persist the outcome of a run whose lease was given up early, unless
    /// another worker has claimed the job in the meantime.
    async fn report_after_shutdown(
        &self,
        job_id: &str,
        outcome: ExecutionOutcome,
    ) -> Result<CycleOutcome, JobError> {
        let mut current = self.deps.store.get(job_id).await?;
        if current.state != JobState::Processing || current.is_locked() {
            info!(
                worker_id = %self.id,
                job_id,
                state = %current.state,
                holder = current.locked_by.as_deref().unwrap_or("-"),
                "Job was reclaimed, discarding result"
            );
            return Ok(CycleOutcome::Abandoned);
        }
        self.report(&mut current, outcome).await
    }

    async fn report(
        &self,
        job: &mut Job,
        outcome: ExecutionOutcome,
    ) -> Result<CycleOutcome, JobError> {
        self.enter(WorkerPhase::Reporting);

        match outcome {
            ExecutionOutcome::Success => {
                job.mark_completed()?;
                self.deps.store.update(job).await?;
                info!(worker_id = %self.id, job_id = %job.id, "Job completed");
                Ok(CycleOutcome::Completed)
            }
            ExecutionOutcome::Failure { message } => {
                let state = job.record_failure(&message, &self.deps.policy)?;
                self.deps.store.update(job).await?;
                if state == JobState::Dead {
                    warn!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        error = %message,
                        "Job exhausted retries, moved to dead letter queue"
                    );
                    Ok(CycleOutcome::Dead)
                } else {
                    info!(
                        worker_id = %self.id,
                        job_id = %job.id,
                        attempts = job.attempts,
                        max_retries = job.max_retries,
                        next_retry_at = ?job.next_retry_at,
                        error = %message,
                        "Job failed, retry scheduled"
                    );
                    Ok(CycleOutcome::Retrying)
                }
            }
        }
    }

    /// Sleep, waking early on shutdown.
    async fn pause(&self, duration: Duration) {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = wait_for_shutdown(&mut shutdown) => {}
        }
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn classify(
    result: Result<Result<CommandOutput, ExecError>, Box<dyn Any + Send>>,
) -> ExecutionOutcome {
    match result {
        Ok(result) => ExecutionOutcome::from_result(result),
        Err(panic) => ExecutionOutcome::execution_error(panic_message(panic.as_ref())),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during execution".to_string()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use tokio::sync::Notify;

    use super::*;
    use crate::error::DatabaseError;
    use crate::job::model::now;
    use crate::store::{LibSqlJobStore, QueueStats};

    /// Executor returning a canned result for every command.
    struct FnExecutor<F>(F);

    #[async_trait]
    impl<F> CommandExecutor for FnExecutor<F>
    where
        F: Fn(&str) -> Result<CommandOutput, ExecError> + Send + Sync,
    {
        async fn execute(&self, command: &str) -> Result<CommandOutput, ExecError> {
            (self.0)(command)
        }
    }

    fn exits(code: i32, stderr: &'static str) -> impl Fn(&str) -> Result<CommandOutput, ExecError> {
        move |_| {
            Ok(CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            })
        }
    }

    /// Executor that blocks until the test opens the gate.
    #[derive(Default)]
    struct GatedExecutor {
        started: Notify,
        gate: Notify,
    }

    #[async_trait]
    impl CommandExecutor for GatedExecutor {
        async fn execute(&self, _command: &str) -> Result<CommandOutput, ExecError> {
            self.started.notify_one();
            self.gate.notified().await;
            Ok(CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    /// Store with switchable write failures.
    struct FaultyStore {
        inner: LibSqlJobStore,
        fail_update: bool,
        fail_release: bool,
    }

    impl FaultyStore {
        async fn with_job(job: Job) -> Self {
            let inner = LibSqlJobStore::new_memory().await.unwrap();
            inner.add(&job).await.unwrap();
            Self {
                inner,
                fail_update: false,
                fail_release: false,
            }
        }
    }

    #[async_trait]
    impl JobStore for FaultyStore {
        async fn add(&self, job: &Job) -> Result<(), JobError> {
            self.inner.add(job).await
        }
        async fn get(&self, id: &str) -> Result<Job, JobError> {
            self.inner.get(id).await
        }
        async fn update(&self, job: &Job) -> Result<(), JobError> {
            if self.fail_update {
                return Err(DatabaseError::Query("update: disk I/O error".into()).into());
            }
            self.inner.update(job).await
        }
        async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobError> {
            self.inner.list(state).await
        }
        async fn stats(&self) -> Result<QueueStats, JobError> {
            self.inner.stats().await
        }
        async fn acquire(&self, worker_id: &str) -> Result<Option<Job>, JobError> {
            self.inner.acquire(worker_id).await
        }
        async fn release(&self, id: &str) -> Result<(), JobError> {
            if self.fail_release {
                return Err(DatabaseError::Query("release: database is locked".into()).into());
            }
            self.inner.release(id).await
        }
        async fn retry_dead(&self, id: &str) -> Result<Job, JobError> {
            self.inner.retry_dead(id).await
        }
    }

    fn worker(
        store: Arc<dyn JobStore>,
        executor: Arc<dyn CommandExecutor>,
    ) -> (Worker, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let deps = WorkerDeps {
            store,
            executor,
            policy: RetryPolicy::default(),
            config: WorkerConfig {
                idle_interval: Duration::from_millis(20),
                job_timeout: Duration::from_secs(5),
                error_pause: Duration::from_millis(20),
            },
        };
        (Worker::new("w-test", deps, rx), tx)
    }

    async fn store_with(job: Job) -> Arc<LibSqlJobStore> {
        let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        store.add(&job).await.unwrap();
        store
    }

    /// Make a scheduled retry due now.
    async fn make_due(store: &LibSqlJobStore, id: &str) {
        let mut job = store.get(id).await.unwrap();
        job.next_retry_at = Some(now() - TimeDelta::seconds(1));
        store.update(&job).await.unwrap();
    }

    #[tokio::test]
    async fn idle_when_queue_empty() {
        let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        let (worker, _tx) = worker(store, Arc::new(FnExecutor(exits(0, ""))));
        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);
    }

    #[tokio::test]
    async fn success_completes_job() {
        let store = store_with(Job::new("j1", "true", 3)).await;
        let (worker, _tx) = worker(store.clone(), Arc::new(FnExecutor(exits(0, ""))));

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Completed);
        let job = store.get("j1").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error_message, None);
        assert_eq!(job.locked_by, None);
    }

    #[tokio::test]
    async fn failures_retry_then_die() {
        let store = store_with(Job::new("j2", "false", 2)).await;
        let (worker, _tx) = worker(store.clone(), Arc::new(FnExecutor(exits(1, "nope"))));

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Retrying);
        let job = store.get("j2").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.error_message.as_deref(), Some("nope"));
        assert!(job.next_retry_at.is_some());
        assert_eq!(job.locked_by, None);

        // Not due yet.
        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);

        make_due(&store, "j2").await;
        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Dead);
        let job = store.get("j2").await.unwrap();
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 2);
        assert!(job.error_message.unwrap().contains("Exceeded max retries"));
        assert_eq!(job.next_retry_at, None);
    }

    #[tokio::test]
    async fn timeout_is_recorded() {
        let store = store_with(Job::new("slow", "sleep 999", 3)).await;
        let executor = FnExecutor(|_: &str| -> Result<CommandOutput, ExecError> {
            Err(ExecError::Timeout(Duration::from_secs(300)))
        });
        let (worker, _tx) = worker(store.clone(), Arc::new(executor));

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Retrying);
        let job = store.get("slow").await.unwrap();
        assert_eq!(job.error_message.as_deref(), Some("Job execution timed out"));
    }

    #[tokio::test]
    async fn panic_in_executor_is_a_failure() {
        let store = store_with(Job::new("boom", "true", 3)).await;
        let executor = FnExecutor(|_: &str| -> Result<CommandOutput, ExecError> {
            panic!("executor exploded")
        });
        let (worker, _tx) = worker(store.clone(), Arc::new(executor));

        assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Retrying);
        let job = store.get("boom").await.unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("Execution error: executor exploded")
        );
        assert_eq!(job.locked_by, None);
    }

    #[tokio::test]
    async fn store_error_still_releases_lease() {
        let mut faulty = FaultyStore::with_job(Job::new("j", "true", 3)).await;
        faulty.fail_update = true;
        let store = Arc::new(faulty);
        let (worker, _tx) = worker(store.clone(), Arc::new(FnExecutor(exits(0, ""))));

        let err = worker.run_once().await.unwrap_err();
        assert!(matches!(err, JobError::Database(_)));
        let job = store.get("j").await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by, None);
    }

    async fn wait_until_unleased(store: &LibSqlJobStore, id: &str) -> Job {
        for _ in 0..200 {
            let job = store.get(id).await.unwrap();
            if !job.is_locked() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lease on {id} was never released");
    }

    #[tokio::test]
    async fn shutdown_mid_execution_releases_then_records() {
        let store = store_with(Job::new("long", "sleep 10", 3)).await;
        let executor = Arc::new(GatedExecutor::default());
        let (worker, tx) = worker(store.clone(), executor.clone());
        let worker = Arc::new(worker);

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run_once().await }
        });

        executor.started.notified().await;
        tx.send(true).unwrap();

        let job = wait_until_unleased(&store, "long").await;
        assert_eq!(job.state, JobState::Processing);

        executor.gate.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), CycleOutcome::Completed);
        assert_eq!(store.get("long").await.unwrap().state, JobState::Completed);
    }

    #[tokio::test]
    async fn shutdown_result_discarded_when_reclaimed() {
        let store = store_with(Job::new("long", "sleep 10", 3)).await;
        let executor = Arc::new(GatedExecutor::default());
        let (worker, tx) = worker(store.clone(), executor.clone());
        let worker = Arc::new(worker);

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run_once().await }
        });

        executor.started.notified().await;
        tx.send(true).unwrap();
        let mut released = wait_until_unleased(&store, "long").await;

        // Still running here, so nobody else may pick it up yet.
        assert!(store.acquire("w-other").await.unwrap().is_none());

        // The command outlives the lease timeout.
        released.updated_at = now() - TimeDelta::seconds(301);
        store.update(&released).await.unwrap();
        let reclaimed = store.acquire("w-other").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, "long");

        executor.gate.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), CycleOutcome::Abandoned);

        let job = store.get("long").await.unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.locked_by.as_deref(), Some("w-other"));
    }

    #[tokio::test]
    async fn failed_release_on_shutdown_lets_command_finish() {
        let mut faulty = FaultyStore::with_job(Job::new("long", "sleep 10", 3)).await;
        faulty.fail_release = true;
        let store = Arc::new(faulty);
        let executor = Arc::new(GatedExecutor::default());
        let (worker, tx) = worker(store.clone(), executor.clone());
        let worker = Arc::new(worker);

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run_once().await }
        });

        executor.started.notified().await;
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        executor.gate.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), CycleOutcome::Completed);
        let job = store.get("long").await.unwrap();
        assert_eq!(job.state, JobState::Completed);
    }

    #[tokio::test]
    async fn run_drains_queue_and_stops_on_shutdown() {
        let store = Arc::new(LibSqlJobStore::new_memory().await.unwrap());
        for id in ["a", "b", "c"] {
            store.add(&Job::new(id, "true", 3)).await.unwrap();
        }
        let (worker, tx) = worker(store.clone(), Arc::new(FnExecutor(exits(0, ""))));
        let worker = Arc::new(worker);

        let task = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run().await }
        });

        for _ in 0..200 {
            if store.stats().await.unwrap().completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.stats().await.unwrap().completed, 3);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("worker did not stop")
            .unwrap();
    }

    #[test]
    fn panic_payloads() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(owned.as_ref()), "owned");
        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "panic during execution");
    }
}
