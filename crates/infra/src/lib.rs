//! Infrastructure layer: SQLite storage, the claim protocol, worker processes
//! and their supervision.

pub mod config_store;
pub mod db;
pub mod jobs;
pub mod queue;
pub mod workers;

pub use config_store::{ConfigStore, InMemoryConfigStore, SqliteConfigStore};
pub use db::{default_db_path, Database};
pub use jobs::{
    apply_execution_fault, apply_outcome, claim, ClaimAttempt, CommandRunner, DeadLetterOrder,
    InMemoryJobStore, JobCounts, JobStore, ShellRunner, SqliteJobStore,
};
pub use queue::{Queue, QueueStatus};
pub use workers::{
    install_shutdown_handler, run_worker_process, DetachedLauncher, ProcessLauncher, StopReport,
    Supervisor, Worker,
};
