//! jobqueue — a persistent background-job queue with retries, exponential
//! backoff, a dead letter queue, and supervised worker processes sharing one
//! SQLite store.

pub mod config;
pub mod error;
pub mod exec;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use config::{QueueConfig, WorkerConfig};
pub use error::{Error, Result};
pub use job::{Job, JobState, NewJob, RetryPolicy};
pub use queue::JobQueue;
pub use store::{JobStore, LibSqlJobStore, QueueStats};
