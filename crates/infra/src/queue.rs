//! `Queue`: one handle over the database and every store built on it.
//!
//! Each CLI invocation opens one, performs a single operation and closes it.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use queuectl_core::{
    ConfigKey, Job, JobId, JobStatus, JobSubmission, QueueError, QueueResult, WorkerRecord,
};

use crate::config_store::{ConfigStore, SqliteConfigStore};
use crate::db::Database;
use crate::jobs::{DeadLetterOrder, JobCounts, JobStore, SqliteJobStore};
use crate::workers::{ProcessLauncher, SqliteWorkerRegistry, Supervisor, WorkerRegistry};

/// Counts per state plus the worker ledger.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub jobs: JobCounts,
    pub workers: Vec<WorkerRecord>,
}

#[derive(Clone)]
pub struct Queue {
    db: Database,
    jobs: Arc<SqliteJobStore>,
    config: Arc<SqliteConfigStore>,
    workers: Arc<SqliteWorkerRegistry>,
}

impl Queue {
    pub async fn open(path: impl AsRef<Path>) -> QueueResult<Self> {
        let db = Database::open(path).await?;
        Ok(Self::with_database(db))
    }

    pub fn with_database(db: Database) -> Self {
        Self {
            jobs: Arc::new(SqliteJobStore::new(&db)),
            config: Arc::new(SqliteConfigStore::new(&db)),
            workers: Arc::new(SqliteWorkerRegistry::new(&db)),
            db,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Validate a JSON submission and persist it as a pending job.
    ///
    /// `max_retries` defaults to the live config value.
    pub async fn enqueue(&self, payload: &str) -> QueueResult<Job> {
        let submission = JobSubmission::from_json(payload)?;
        self.submit(submission).await
    }

    pub async fn submit(&self, submission: JobSubmission) -> QueueResult<Job> {
        let default_max_retries = self.config.max_retries().await?;
        let new_job = submission.validate(default_max_retries)?;
        let job = self.jobs.insert(new_job, Utc::now()).await?;
        info!(job_id = %job.id, priority = job.priority, max_retries = job.max_retries, "job enqueued");
        Ok(job)
    }

    pub async fn get(&self, id: &JobId) -> QueueResult<Job> {
        self.jobs
            .get(id)
            .await?
            .ok_or_else(|| QueueError::not_found(format!("job {id}")))
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        self.jobs.list(status, limit).await
    }

    pub async fn status(&self) -> QueueResult<QueueStatus> {
        Ok(QueueStatus {
            jobs: self.jobs.counts().await?,
            workers: self.workers.all().await?,
        })
    }

    pub async fn list_dead(&self, limit: usize, order: DeadLetterOrder) -> QueueResult<Vec<Job>> {
        self.jobs.list_dead(limit, order).await
    }

    /// Move a dead job back to pending with `attempts = 0`.
    pub async fn requeue(&self, id: &JobId) -> QueueResult<Job> {
        let job = self.jobs.requeue_dead(id, Utc::now()).await?;
        info!(job_id = %job.id, "dead job requeued");
        Ok(job)
    }

    pub async fn config_get(&self, key: ConfigKey) -> QueueResult<String> {
        self.config.get(key).await
    }

    pub async fn config_set(&self, key: ConfigKey, value: &str) -> QueueResult<()> {
        self.config.set(key, value).await?;
        info!(key = %key, value, "config updated");
        Ok(())
    }

    pub async fn config_list(&self) -> QueueResult<Vec<(String, String)>> {
        self.config.entries().await
    }

    /// Supervisor over this queue's workers using `launcher` for processes.
    pub fn supervisor<L: ProcessLauncher>(&self, launcher: L) -> Supervisor<L> {
        Supervisor::new(
            self.config.clone(),
            self.workers.clone(),
            launcher,
            self.db.path().to_path_buf(),
        )
    }

    pub async fn close(self) {
        self.db.close().await;
    }
}
