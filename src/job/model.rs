//! Job record and its state machine.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;
use crate::job::retry::RetryPolicy;

/// Maximum stored length of `error_message`, in characters.
pub const MAX_ERROR_LEN: usize = 500;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its first claim.
    Pending,
    /// Leased by a worker and executing.
    Processing,
    /// Finished with exit code 0.
    Completed,
    /// Failed at least once; claimable again once `next_retry_at` passes.
    Failed,
    /// Retries exhausted. Lives in the dead letter queue.
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Failed, Processing) |
            // Reclaiming a stale lease
            (Processing, Processing) |
            (Processing, Completed) | (Processing, Failed) | (Processing, Dead) |
            // DLQ retry
            (Dead, Pending)
        )
    }

    /// Completed and dead jobs never change state on their own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead" => Ok(Self::Dead),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job submission before it is persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    /// Client-supplied id. A UUID is generated when absent.
    pub id: Option<String>,
    pub command: String,
    /// Falls back to the configured default when absent.
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Reject malformed submissions before anything touches the store.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.command.trim().is_empty() {
            return Err(JobError::Validation("command must not be empty".into()));
        }
        if let Some(id) = &self.id {
            if id.is_empty() {
                return Err(JobError::Validation("id must not be empty".into()));
            }
            if id.chars().any(char::is_whitespace) {
                return Err(JobError::Validation(format!(
                    "id must not contain whitespace: {id:?}"
                )));
            }
        }
        Ok(())
    }
}

/// A persisted unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a pending job.
    pub fn new(id: impl Into<String>, command: impl Into<String>, max_retries: u32) -> Self {
        let now = now();
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            error_message: None,
            next_retry_at: None,
            locked_by: None,
            locked_at: None,
        }
    }

    /// Build a job from a validated submission.
    pub fn from_submission(submission: NewJob, default_max_retries: u32) -> Self {
        let id = submission
            .id
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self::new(
            id,
            submission.command,
            submission.max_retries.unwrap_or(default_max_retries),
        )
    }

    pub fn is_locked(&self) -> bool {
        self.locked_by.is_some()
    }

    /// True iff the job still has retry budget and has not succeeded.
    pub fn should_retry(&self) -> bool {
        self.state != JobState::Completed && self.attempts < self.max_retries
    }

    /// Success: completed, error and retry time cleared.
    pub fn mark_completed(&mut self) -> Result<(), JobError> {
        self.transition(JobState::Completed)?;
        self.error_message = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Record a failed attempt and decide between a scheduled retry and the DLQ.
    ///
    /// The returned state is what the caller must persist in a single update.
    pub fn record_failure(
        &mut self,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<JobState, JobError> {
        if self.state != JobState::Processing {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: JobState::Failed,
            });
        }
        let now = now();
        self.attempts = self.attempts.saturating_add(1);
        self.error_message = Some(truncate_chars(message, MAX_ERROR_LEN));

        if self.should_retry() {
            self.transition(JobState::Failed)?;
            self.next_retry_at = Some(policy.retry_at(now, self.attempts));
        } else {
            self.transition(JobState::Dead)?;
            self.error_message = Some(format!("Exceeded max retries ({})", self.max_retries));
            self.next_retry_at = None;
        }
        self.updated_at = now;
        Ok(self.state)
    }

    /// Put a dead job back at the front of its life: pending, no attempts.
    pub fn reset_from_dlq(&mut self) -> Result<(), JobError> {
        if self.state != JobState::Dead {
            return Err(JobError::NotInDlq {
                id: self.id.clone(),
                state: self.state,
            });
        }
        self.transition(JobState::Pending)?;
        self.attempts = 0;
        self.error_message = None;
        self.next_retry_at = None;
        self.locked_by = None;
        self.locked_at = None;
        Ok(())
    }

    fn transition(&mut self, target: JobState) -> Result<(), JobError> {
        if !self.state.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: target,
            });
        }
        self.state = target;
        self.updated_at = now();
        Ok(())
    }
}

/// Current time at the precision the store persists.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(9)
}

/// Truncate to at most `max` characters (UTF-8 safe).
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}
