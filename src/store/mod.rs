//! Persistence layer — SQLite-backed job storage shared across worker processes.

pub mod lease;
pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use lease::LEASE_TIMEOUT;
pub use libsql_backend::LibSqlJobStore;
pub use traits::{JobStore, QueueStats};
