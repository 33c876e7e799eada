//! Job record, state machine, and retry policy.

pub mod model;
pub mod retry;

pub use model::{Job, JobState, MAX_ERROR_LEN, NewJob};
pub use retry::RetryPolicy;
