//! `JobQueue` — one handle over the store and the worker supervisor.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::config::{QueueConfig, WorkerConfig};
use crate::error::Result;
use crate::exec::ShellExecutor;
use crate::job::{Job, JobState, NewJob};
use crate::store::{JobStore, LibSqlJobStore, QueueStats};
use crate::worker::{StopReport, Supervisor, Worker, WorkerDeps, WorkerLauncher};

pub struct JobQueue {
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    supervisor: Supervisor,
}

impl JobQueue {
    /// Open the queue under `config.data_dir`, creating the layout on first use.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        config.ensure_dirs()?;
        let store = LibSqlJobStore::new_local(&config.db_path()).await?;
        let launcher = WorkerLauncher::current_exe()?;
        Ok(Self::with_parts(config, Arc::new(store), launcher))
    }

    pub fn with_parts(
        config: QueueConfig,
        store: Arc<dyn JobStore>,
        launcher: WorkerLauncher,
    ) -> Self {
        let supervisor = Supervisor::new(config.clone(), launcher);
        Self {
            config,
            store,
            supervisor,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and persist a new pending job.
    pub async fn enqueue(&self, submission: NewJob) -> Result<Job> {
        submission.validate()?;
        let job = Job::from_submission(submission, self.config.max_retries);
        self.store.add(&job).await?;
        info!(job_id = %job.id, command = %job.command, max_retries = job.max_retries, "Job enqueued");
        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        Ok(self.store.get(id).await?)
    }

    pub async fn update_job(&self, job: &Job) -> Result<()> {
        Ok(self.store.update(job).await?)
    }

    pub async fn list_jobs(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        Ok(self.store.list(state).await?)
    }

    /// Jobs in the dead letter queue.
    pub async fn dlq_jobs(&self) -> Result<Vec<Job>> {
        self.list_jobs(Some(JobState::Dead)).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.stats().await?)
    }

    /// Move a dead job back to pending with a fresh retry budget.
    pub async fn retry_from_dlq(&self, id: &str) -> Result<Job> {
        Ok(self.store.retry_dead(id).await?)
    }

    pub async fn start_workers(&self, count: usize) -> Result<Vec<u32>> {
        let pids = self.supervisor.start(count).await?;
        info!(count = pids.len(), "Workers started");
        Ok(pids)
    }

    pub async fn stop_workers(&self) -> StopReport {
        self.supervisor.stop().await
    }

    pub fn active_worker_count(&self) -> usize {
        self.supervisor.active_count()
    }

    /// Build an in-process worker bound to this queue's store.
    pub fn worker(
        &self,
        id: impl Into<String>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Worker {
        let executor = ShellExecutor::new().with_timeout(config.job_timeout);
        let deps = WorkerDeps {
            store: Arc::clone(&self.store),
            executor: Arc::new(executor),
            policy: self.config.retry_policy(),
            config,
        };
        Worker::new(id, deps, shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, JobError};

    async fn test_queue() -> JobQueue {
        let store = LibSqlJobStore::new_memory().await.unwrap();
        let config = QueueConfig::default().with_data_dir(std::env::temp_dir().join("jq-unused"));
        JobQueue::with_parts(
            config,
            Arc::new(store),
            WorkerLauncher::command("sleep", ["30"]),
        )
    }

    #[tokio::test]
    async fn enqueue_applies_defaults() {
        let queue = test_queue().await;
        let job = queue.enqueue(NewJob::new("echo hi")).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert!(uuid::Uuid::parse_str(&job.id).is_ok());
        assert_eq!(queue.get_job(&job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn enqueue_respects_explicit_fields() {
        let queue = test_queue().await;
        let job = queue
            .enqueue(NewJob::new("true").with_id("j1").with_max_retries(7))
            .await
            .unwrap();
        assert_eq!(job.id, "j1");
        assert_eq!(job.max_retries, 7);
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicates_and_invalid_input() {
        let queue = test_queue().await;
        queue.enqueue(NewJob::new("true").with_id("j1")).await.unwrap();

        let err = queue.enqueue(NewJob::new("false").with_id("j1")).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::DuplicateId { .. })));

        let err = queue.enqueue(NewJob::new("   ")).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Validation(_))));

        let err = queue.enqueue(NewJob::new("true").with_id("has space")).await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::Validation(_))));

        assert_eq!(queue.list_jobs(None).await.unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn dlq_round_trip() {
        let queue = test_queue().await;
        queue
            .enqueue(NewJob::new("false").with_id("doomed").with_max_retries(1))
            .await
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let worker = queue.worker("w1", WorkerConfig::default(), rx);
        worker.run_once().await.unwrap();

        let dlq = queue.dlq_jobs().await.unwrap();
        assert_eq!(dlq.len(), 1);
        assert_eq!(dlq[0].id, "doomed");
        assert_eq!(queue.stats().await.unwrap().dead, 1);

        let job = queue.retry_from_dlq("doomed").await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert!(queue.dlq_jobs().await.unwrap().is_empty());

        let err = queue.retry_from_dlq("doomed").await.unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotInDlq { .. })));
    }

    #[tokio::test]
    async fn no_workers_recorded_initially() {
        let tmp = tempfile::tempdir().unwrap();
        let store = LibSqlJobStore::new_memory().await.unwrap();
        let queue = JobQueue::with_parts(
            QueueConfig::default().with_data_dir(tmp.path()),
            Arc::new(store),
            WorkerLauncher::command("sleep", ["30"]),
        );
        assert_eq!(queue.active_worker_count(), 0);
        let report = queue.stop_workers().await;
        assert_eq!(report, StopReport::default());
    }
}
