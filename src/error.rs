//! Error types for the job queue.

use std::time::Duration;

use crate::job::JobState;

/// Top-level error type for the queue.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-level errors surfaced to callers of the queue operations.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job with id {id} already exists")]
    DuplicateId { id: String },

    #[error("Job {id} is not in the dead letter queue (state: {state})")]
    NotInDlq { id: String, state: JobState },

    #[error("Job {id} is {from}, cannot transition to {to}")]
    InvalidTransition {
        id: String,
        from: JobState,
        to: JobState,
    },

    #[error("Invalid job: {0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Command execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Worker process management errors.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn worker {worker_id}: {reason}")]
    SpawnFailed { worker_id: String, reason: String },

    #[error("Cannot locate worker executable: {0}")]
    Executable(String),

    #[error("PID file error: {0}")]
    PidFile(#[from] std::io::Error),
}

/// Result type alias for the queue.
pub type Result<T> = std::result::Result<T, Error>;
