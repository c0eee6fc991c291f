//! Starts worker pools and requests their cooperative shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use queuectl_core::{ConfigKey, QueueResult, WorkerId, WorkerRecord, WorkerStatus};

use crate::config_store::ConfigStore;
use crate::workers::launcher::ProcessLauncher;
use crate::workers::registry::WorkerRegistry;

/// What `stop_workers` did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopReport {
    /// Workers that were sent a termination signal.
    pub signalled: Vec<WorkerId>,
    /// Workers whose process was already gone; marked `stopped`.
    pub already_gone: Vec<WorkerId>,
}

pub struct Supervisor<L> {
    config: Arc<dyn ConfigStore>,
    registry: Arc<dyn WorkerRegistry>,
    launcher: L,
    db_path: PathBuf,
}

impl<L: ProcessLauncher> Supervisor<L> {
    pub fn new(
        config: Arc<dyn ConfigStore>,
        registry: Arc<dyn WorkerRegistry>,
        launcher: L,
        db_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config,
            registry,
            launcher,
            db_path: db_path.into(),
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    /// Register and launch `count` workers.
    ///
    /// Clears `graceful_stop` first so that a previous stop request does not
    /// make the new workers exit on their first iteration. Returns without
    /// waiting for the workers to do anything.
    pub async fn start_workers(&self, count: usize) -> QueueResult<Vec<WorkerRecord>> {
        self.config.set(ConfigKey::GracefulStop, "0").await?;

        let mut started = Vec::with_capacity(count);
        for _ in 0..count {
            let id = WorkerId::new();
            self.registry.register(id, Utc::now()).await?;

            let pid = match self.launcher.launch(id, &self.db_path) {
                Ok(pid) => pid,
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "failed to launch worker");
                    self.registry
                        .set_status(id, WorkerStatus::Stopped, Utc::now())
                        .await?;
                    return Err(e);
                }
            };

            // The worker may already have marked itself running (or even stopped).
            self.registry.mark_running(id, pid, Utc::now()).await?;
            if let Some(record) = self.registry.get(id).await? {
                started.push(record);
            }
        }

        info!(count = started.len(), "workers started");
        Ok(started)
    }

    /// Set `graceful_stop` and signal every `starting`/`running` worker.
    ///
    /// Advisory: workers finish their current job and exit on their own.
    pub async fn stop_workers(&self) -> QueueResult<StopReport> {
        self.config.set(ConfigKey::GracefulStop, "1").await?;

        let mut report = StopReport::default();
        for worker in self.registry.active().await? {
            let delivered = match worker.pid {
                Some(pid) => match self.launcher.terminate(pid) {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        warn!(worker_id = %worker.id, pid, error = %e, "failed to signal worker");
                        continue;
                    }
                },
                // Never got a process: nothing to signal.
                None => false,
            };

            if delivered {
                report.signalled.push(worker.id);
            } else {
                self.registry
                    .set_status(worker.id, WorkerStatus::Stopped, Utc::now())
                    .await?;
                report.already_gone.push(worker.id);
            }
        }

        info!(
            signalled = report.signalled.len(),
            already_gone = report.already_gone.len(),
            "stop requested"
        );
        Ok(report)
    }
}
