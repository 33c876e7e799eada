//! Worker system — job execution loop and process supervision.
//!
//! Core components:
//! - `runner` — the claim/execute/report loop a worker process runs
//! - `supervisor` — launches and stops worker processes
//! - `pidfile` — PID persistence between CLI invocations
//! - `process` — OS signals and liveness checks by PID

pub mod pidfile;
pub mod process;
pub mod runner;
pub mod supervisor;

pub use runner::{CycleOutcome, Worker, WorkerDeps, WorkerPhase};
pub use supervisor::{StopReport, Supervisor, WorkerLauncher};
