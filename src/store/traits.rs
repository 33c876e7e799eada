//! `JobStore` trait — the single async interface for job persistence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::JobError;
use crate::job::{Job, JobState};

/// Job counts per state plus the number of distinct lease holders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    pub active_workers: u64,
}

impl QueueStats {
    pub fn count(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> u64 {
        JobState::ALL.iter().map(|s| self.count(*s)).sum()
    }

    pub(crate) fn set(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Pending => self.pending = count,
            JobState::Processing => self.processing = count,
            JobState::Completed => self.completed = count,
            JobState::Failed => self.failed = count,
            JobState::Dead => self.dead = count,
        }
    }
}

/// Durable job storage shared by every worker process.
///
/// Each mutation is atomic as a unit with respect to other processes
/// using the same backing file.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `DuplicateId` if the id exists.
    async fn add(&self, job: &Job) -> Result<(), JobError>;

    /// Fetch a job by id.
    async fn get(&self, id: &str) -> Result<Job, JobError>;

    /// Write every mutable field of `job`. Callers hold the job's lease.
    ///
    /// Refuses to move a completed or dead job to a different state.
    async fn update(&self, job: &Job) -> Result<(), JobError>;

    /// All jobs, newest first, optionally restricted to one state.
    async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>, JobError>;

    /// Per-state counts and active lease holders.
    async fn stats(&self) -> Result<QueueStats, JobError>;

    // ── Claim protocol ──────────────────────────────────────────────

    /// Atomically lease the next eligible job to `worker_id`.
    ///
    /// `Ok(None)` means nothing is claimable right now.
    async fn acquire(&self, worker_id: &str) -> Result<Option<Job>, JobError>;

    /// Clear a job's lease. No-op when there is none.
    async fn release(&self, id: &str) -> Result<(), JobError>;

    // ── Dead letter queue ───────────────────────────────────────────

    /// Reset a dead job to pending with a fresh retry budget.
    async fn retry_dead(&self, id: &str) -> Result<Job, JobError>;
}
