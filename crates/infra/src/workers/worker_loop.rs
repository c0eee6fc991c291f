//! The worker loop: claim, execute, settle, repeat until told to stop.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use queuectl_core::{Job, JobId, JobStatus, Outcome, QueueError, QueueResult, WorkerId, WorkerStatus};

use crate::config_store::ConfigStore;
use crate::jobs::executor::CommandRunner;
use crate::jobs::settle;
use crate::jobs::{claim, JobStore};
use crate::workers::registry::WorkerRegistry;

/// Why a worker left its loop.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// `graceful_stop` was set in the config store.
    GracefulStop,
    /// A termination signal cancelled the local token.
    Signal,
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// A job was claimed, executed and settled.
    Processed { job_id: JobId, status: JobStatus },
    /// Nothing eligible.
    Idle,
    Stop(StopReason),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_dead: u64,
    pub errors: u64,
}

pub struct Worker {
    id: WorkerId,
    jobs: Arc<dyn JobStore>,
    config: Arc<dyn ConfigStore>,
    registry: Arc<dyn WorkerRegistry>,
    runner: Arc<dyn CommandRunner>,
    shutdown: CancellationToken,
    stats: WorkerStats,
}

impl Worker {
    pub fn new(
        id: WorkerId,
        jobs: Arc<dyn JobStore>,
        config: Arc<dyn ConfigStore>,
        registry: Arc<dyn WorkerRegistry>,
        runner: Arc<dyn CommandRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            id,
            jobs,
            config,
            registry,
            runner,
            shutdown,
            stats: WorkerStats::default(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// One iteration: check both stop conditions, then claim and process at
    /// most one job.
    ///
    /// Stop conditions are checked only here, so a claimed job is always
    /// settled before the worker can exit.
    pub async fn tick(&mut self) -> QueueResult<Tick> {
        if self.shutdown.is_cancelled() {
            return Ok(Tick::Stop(StopReason::Signal));
        }
        if self.config.graceful_stop().await? {
            return Ok(Tick::Stop(StopReason::GracefulStop));
        }

        let Some(job) = claim(self.jobs.as_ref(), self.id, Utc::now()).await? else {
            return Ok(Tick::Idle);
        };

        info!(worker_id = %self.id, job_id = %job.id, attempts = job.attempts, "executing job");
        let outcome = self.runner.run(&job.command).await;
        let settled = self.settle_held(&job, outcome).await?;

        let status = settled.status();
        self.stats.jobs_processed += 1;
        match status {
            JobStatus::Completed => self.stats.jobs_completed += 1,
            JobStatus::Pending => self.stats.jobs_retried += 1,
            JobStatus::Dead => self.stats.jobs_dead += 1,
            JobStatus::Processing | JobStatus::Failed => {}
        }

        Ok(Tick::Processed {
            job_id: settled.id,
            status,
        })
    }

    /// Run until a stop condition, recording the lifecycle in the registry.
    pub async fn run(mut self) -> QueueResult<WorkerStats> {
        let pid = std::process::id();
        if !self.registry.mark_running(self.id, pid, Utc::now()).await? {
            warn!(worker_id = %self.id, "worker was stopped before it started");
            return Ok(self.stats);
        }
        info!(worker_id = %self.id, pid, "worker started");

        let reason = loop {
            match self.tick().await {
                Ok(Tick::Stop(reason)) => break reason,
                Ok(Tick::Processed { job_id, status }) => {
                    debug!(worker_id = %self.id, job_id = %job_id, status = %status, "job settled");
                }
                Ok(Tick::Idle) => self.idle().await,
                Err(e) => {
                    self.stats.errors += 1;
                    error!(worker_id = %self.id, error = %e, "worker iteration failed");
                    self.idle().await;
                }
            }
        };

        info!(worker_id = %self.id, reason = ?reason, "worker stopping");
        self.registry
            .set_status(self.id, WorkerStatus::Stopping, Utc::now())
            .await?;
        self.registry
            .set_status(self.id, WorkerStatus::Stopped, Utc::now())
            .await?;
        info!(worker_id = %self.id, stats = ?self.stats, "worker stopped");
        Ok(self.stats)
    }

    /// Settle a job this worker holds, retrying transient failures.
    ///
    /// Returns an error only when the store reports the job gone or no
    /// longer held by this worker.
    async fn settle_held(&mut self, job: &Job, outcome: Outcome) -> QueueResult<Job> {
        loop {
            match settle::apply(self.jobs.as_ref(), self.config.as_ref(), job, outcome.clone()).await {
                Ok(settled) => return Ok(settled),
                Err(e @ (QueueError::NotFound(_) | QueueError::InvalidState { .. })) => return Err(e),
                Err(e) => {
                    self.stats.errors += 1;
                    warn!(worker_id = %self.id, job_id = %job.id, error = %e, "failed to settle job, retrying");
                    // Not cancellable: a signal must not abandon a claimed job.
                    tokio::time::sleep(self.poll_interval().await).await;
                }
            }
        }
    }

    async fn poll_interval(&self) -> Duration {
        match self.config.poll_interval().await {
            Ok(interval) => interval,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "failed to read poll interval");
                Duration::from_secs(1)
            }
        }
    }

    /// Sleep one poll interval, waking early on shutdown.
    async fn idle(&self) {
        let interval = self.poll_interval().await;

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use queuectl_core::{ConfigKey, NewJob};

    use crate::config_store::InMemoryConfigStore;
    use crate::jobs::InMemoryJobStore;
    use crate::workers::registry::InMemoryWorkerRegistry;

    /// Exits with scripted codes and records what it ran.
    #[derive(Default)]
    struct Scripted {
        codes: Mutex<Vec<i32>>,
        ran: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for Scripted {
        async fn run(&self, command: &str) -> Outcome {
            self.ran.lock().unwrap().push(command.to_string());
            let code = self.codes.lock().unwrap().pop().unwrap_or(0);
            Outcome::Exited {
                code,
                stdout: String::new(),
                stderr: String::new(),
            }
        }
    }

    /// Reports a locked database for the first `failures` backoff reads.
    struct LockedOnce {
        inner: InMemoryConfigStore,
        failures: AtomicU32,
    }

    #[async_trait]
    impl ConfigStore for LockedOnce {
        async fn get_raw(&self, key: ConfigKey) -> QueueResult<Option<String>> {
            if key == ConfigKey::BackoffBase {
                let left = self.failures.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures.store(left - 1, Ordering::SeqCst);
                    return Err(QueueError::storage("database is locked"));
                }
            }
            self.inner.get_raw(key).await
        }

        async fn set_raw(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
            self.inner.set_raw(key, value).await
        }

        async fn entries(&self) -> QueueResult<Vec<(String, String)>> {
            self.inner.entries().await
        }
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        config: Arc<InMemoryConfigStore>,
        registry: Arc<InMemoryWorkerRegistry>,
        runner: Arc<Scripted>,
        token: CancellationToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jobs: InMemoryJobStore::arc(),
                config: Arc::new(InMemoryConfigStore::new()),
                registry: Arc::new(InMemoryWorkerRegistry::new()),
                runner: Arc::new(Scripted::default()),
                token: CancellationToken::new(),
            }
        }

        async fn worker(&self) -> Worker {
            let id = WorkerId::new();
            self.registry.register(id, Utc::now()).await.unwrap();
            Worker::new(
                id,
                self.jobs.clone(),
                self.config.clone(),
                self.registry.clone(),
                self.runner.clone(),
                self.token.clone(),
            )
        }

        async fn enqueue(&self, id: &str, command: &str) {
            self.jobs
                .insert(
                    NewJob {
                        id: JobId::parse(id).unwrap(),
                        command: command.into(),
                        max_retries: 3,
                        priority: 0,
                        run_at: None,
                    },
                    Utc::now(),
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn tick_processes_one_job_then_idles() {
        let fx = Fixture::new();
        fx.enqueue("a", "echo a").await;
        let mut worker = fx.worker().await;

        let tick = worker.tick().await.unwrap();
        assert_eq!(
            tick,
            Tick::Processed {
                job_id: JobId::parse("a").unwrap(),
                status: JobStatus::Completed
            }
        );
        assert_eq!(worker.tick().await.unwrap(), Tick::Idle);
        assert_eq!(*fx.runner.ran.lock().unwrap(), vec!["echo a".to_string()]);
        assert_eq!(worker.stats().jobs_completed, 1);
    }

    #[tokio::test]
    async fn failed_job_is_rescheduled_not_rerun_immediately() {
        let fx = Fixture::new();
        fx.runner.codes.lock().unwrap().push(1);
        fx.enqueue("a", "false").await;
        let mut worker = fx.worker().await;

        assert!(matches!(
            worker.tick().await.unwrap(),
            Tick::Processed { status: JobStatus::Pending, .. }
        ));
        // backoff of 2^1 seconds keeps it out of reach
        assert_eq!(worker.tick().await.unwrap(), Tick::Idle);
    }

    #[tokio::test]
    async fn graceful_stop_is_read_every_tick() {
        let fx = Fixture::new();
        fx.enqueue("a", "true").await;
        let mut worker = fx.worker().await;

        fx.config.set(ConfigKey::GracefulStop, "1").await.unwrap();
        assert_eq!(worker.tick().await.unwrap(), Tick::Stop(StopReason::GracefulStop));
        assert!(fx.runner.ran.lock().unwrap().is_empty());

        fx.config.set(ConfigKey::GracefulStop, "0").await.unwrap();
        assert!(matches!(worker.tick().await.unwrap(), Tick::Processed { .. }));
    }

    #[tokio::test]
    async fn run_records_lifecycle_and_exits_on_signal() {
        let fx = Fixture::new();
        fx.config.set(ConfigKey::PollIntervalSec, "0.01").await.unwrap();
        fx.enqueue("a", "true").await;
        let worker = fx.worker().await;
        let id = worker.id();

        let handle = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(100)).await;
        fx.token.cancel();
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(stats.jobs_completed, 1);
        let record = fx.registry.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, WorkerStatus::Stopped);
        assert_eq!(record.pid, Some(std::process::id()));
    }

    #[tokio::test]
    async fn transient_settle_failure_keeps_the_job_until_it_lands() {
        let fx = Fixture::new();
        fx.runner.codes.lock().unwrap().push(1);
        fx.enqueue("a", "false").await;

        let config = Arc::new(LockedOnce {
            inner: InMemoryConfigStore::new(),
            failures: AtomicU32::new(1),
        });
        config.set(ConfigKey::PollIntervalSec, "0.01").await.unwrap();
        let id = WorkerId::new();
        fx.registry.register(id, Utc::now()).await.unwrap();
        let mut worker = Worker::new(
            id,
            fx.jobs.clone(),
            config.clone(),
            fx.registry.clone(),
            fx.runner.clone(),
            fx.token.clone(),
        );

        assert_eq!(
            worker.tick().await.unwrap(),
            Tick::Processed {
                job_id: JobId::parse("a").unwrap(),
                status: JobStatus::Pending
            }
        );
        let job = fx.jobs.get(&JobId::parse("a").unwrap()).await.unwrap().unwrap();
        assert_eq!(job.status(), JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(fx.runner.ran.lock().unwrap().len(), 1);
        assert_eq!(worker.stats().errors, 1);
        assert_eq!(worker.stats().jobs_retried, 1);
        assert_eq!(config.failures.load(Ordering::SeqCst), 0);
    }
}
