//! Worker processes: the loop itself, the registry, and the supervisor that
//! starts and stops pools of them.

pub mod launcher;
pub mod registry;
pub mod shutdown;
pub mod supervisor;
pub mod worker_loop;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use queuectl_core::{QueueResult, WorkerId};

use crate::config_store::SqliteConfigStore;
use crate::db::Database;
use crate::jobs::{ShellRunner, SqliteJobStore};

pub use launcher::{DetachedLauncher, ProcessLauncher};
pub use registry::{InMemoryWorkerRegistry, SqliteWorkerRegistry, WorkerRegistry};
pub use shutdown::install_shutdown_handler;
pub use supervisor::{StopReport, Supervisor};
pub use worker_loop::{StopReason, Tick, Worker, WorkerStats};

/// Body of a spawned worker process: run `worker_id` against `db` until it
/// stops, then close the database.
pub async fn run_worker_process(
    db: Database,
    worker_id: WorkerId,
    shutdown: CancellationToken,
) -> QueueResult<WorkerStats> {
    let worker = Worker::new(
        worker_id,
        Arc::new(SqliteJobStore::new(&db)),
        Arc::new(SqliteConfigStore::new(&db)),
        Arc::new(SqliteWorkerRegistry::new(&db)),
        Arc::new(ShellRunner::default()),
        shutdown,
    );

    let result = worker.run().await;
    db.close().await;
    result
}
