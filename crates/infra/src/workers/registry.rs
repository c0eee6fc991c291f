//! Worker ledger: identity, OS process id and lifecycle status per worker.
//!
//! Rows are never deleted; `status` reporting reads the full history.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{QueueError, QueueResult, WorkerId, WorkerRecord, WorkerStatus};

use crate::db::{decode_ts, encode_ts, map_sqlx_error, Database};

#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Record a new worker in `starting`.
    async fn register(&self, id: WorkerId, now: DateTime<Utc>) -> QueueResult<WorkerRecord>;

    /// Move a `starting` (or already `running`) worker to `running` with its pid.
    ///
    /// Returns `false` when the worker has already begun stopping; its row is
    /// left alone.
    async fn mark_running(&self, id: WorkerId, pid: u32, now: DateTime<Utc>) -> QueueResult<bool>;

    async fn set_status(&self, id: WorkerId, status: WorkerStatus, now: DateTime<Utc>) -> QueueResult<()>;

    async fn get(&self, id: WorkerId) -> QueueResult<Option<WorkerRecord>>;

    /// Workers in `starting` or `running`.
    async fn active(&self) -> QueueResult<Vec<WorkerRecord>>;

    /// Every worker ever registered, oldest first.
    async fn all(&self) -> QueueResult<Vec<WorkerRecord>>;
}

/// Worker registry backed by the `workers` table.
#[derive(Debug, Clone)]
pub struct SqliteWorkerRegistry {
    pool: SqlitePool,
}

impl SqliteWorkerRegistry {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl WorkerRegistry for SqliteWorkerRegistry {
    #[instrument(skip(self), fields(worker_id = %id), err)]
    async fn register(&self, id: WorkerId, now: DateTime<Utc>) -> QueueResult<WorkerRecord> {
        let row = sqlx::query(
            "INSERT INTO workers (id, pid, status, started_at, updated_at)
             VALUES (?1, NULL, 'starting', ?2, ?2)
             RETURNING id, pid, status, started_at, updated_at",
        )
        .bind(id.to_string())
        .bind(encode_ts(now))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_worker", e))?;

        decode_worker(&row)
    }

    #[instrument(skip(self), fields(worker_id = %id), err)]
    async fn mark_running(&self, id: WorkerId, pid: u32, now: DateTime<Utc>) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE workers SET status = 'running', pid = ?2, updated_at = ?3
             WHERE id = ?1 AND status IN ('starting', 'running')",
        )
        .bind(id.to_string())
        .bind(i64::from(pid))
        .bind(encode_ts(now))
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_worker_running", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(record) => {
                debug!(worker_id = %id, status = %record.status, "worker already past running");
                Ok(false)
            }
            None => Err(QueueError::not_found(format!("worker {id}"))),
        }
    }

    #[instrument(skip(self), fields(worker_id = %id, status = %status), err)]
    async fn set_status(&self, id: WorkerId, status: WorkerStatus, now: DateTime<Utc>) -> QueueResult<()> {
        let result = sqlx::query("UPDATE workers SET status = ?2, updated_at = ?3 WHERE id = ?1")
            .bind(id.to_string())
            .bind(status.as_str())
            .bind(encode_ts(now))
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("set_worker_status", e))?;

        if result.rows_affected() == 0 {
            return Err(QueueError::not_found(format!("worker {id}")));
        }
        Ok(())
    }

    async fn get(&self, id: WorkerId) -> QueueResult<Option<WorkerRecord>> {
        let row = sqlx::query("SELECT id, pid, status, started_at, updated_at FROM workers WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_worker", e))?;

        row.as_ref().map(decode_worker).transpose()
    }

    async fn active(&self) -> QueueResult<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            "SELECT id, pid, status, started_at, updated_at FROM workers
             WHERE status IN ('starting', 'running')
             ORDER BY started_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("active_workers", e))?;

        rows.iter().map(decode_worker).collect()
    }

    async fn all(&self) -> QueueResult<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            "SELECT id, pid, status, started_at, updated_at FROM workers ORDER BY started_at, id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("all_workers", e))?;

        rows.iter().map(decode_worker).collect()
    }
}

fn decode_worker(row: &SqliteRow) -> QueueResult<WorkerRecord> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_worker", e);
    let id: String = row.try_get("id").map_err(get)?;
    let pid: Option<i64> = row.try_get("pid").map_err(get)?;
    let status: String = row.try_get("status").map_err(get)?;
    let started_at: String = row.try_get("started_at").map_err(get)?;
    let updated_at: String = row.try_get("updated_at").map_err(get)?;

    Ok(WorkerRecord {
        id: id
            .parse()
            .map_err(|_| QueueError::storage(format!("bad worker id in workers.id: {id:?}")))?,
        pid: pid.and_then(|p| u32::try_from(p).ok()),
        status: status.parse()?,
        started_at: decode_ts("workers.started_at", &started_at)?,
        updated_at: decode_ts("workers.updated_at", &updated_at)?,
    })
}

/// In-memory worker registry for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryWorkerRegistry {
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
}

impl InMemoryWorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> QueueError {
        QueueError::storage("worker registry lock poisoned")
    }

    fn sorted(&self, filter: impl Fn(&WorkerRecord) -> bool) -> QueueResult<Vec<WorkerRecord>> {
        let workers = self.workers.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = workers.values().filter(|w| filter(w)).cloned().collect();
        result.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        Ok(result)
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn register(&self, id: WorkerId, now: DateTime<Utc>) -> QueueResult<WorkerRecord> {
        let mut workers = self.workers.write().map_err(|_| Self::poisoned())?;
        let record = WorkerRecord {
            id,
            pid: None,
            status: WorkerStatus::Starting,
            started_at: now,
            updated_at: now,
        };
        workers.insert(id, record.clone());
        Ok(record)
    }

    async fn mark_running(&self, id: WorkerId, pid: u32, now: DateTime<Utc>) -> QueueResult<bool> {
        let mut workers = self.workers.write().map_err(|_| Self::poisoned())?;
        let record = workers
            .get_mut(&id)
            .ok_or_else(|| QueueError::not_found(format!("worker {id}")))?;
        if !record.status.is_active() {
            return Ok(false);
        }
        record.status = WorkerStatus::Running;
        record.pid = Some(pid);
        record.updated_at = now;
        Ok(true)
    }

    async fn set_status(&self, id: WorkerId, status: WorkerStatus, now: DateTime<Utc>) -> QueueResult<()> {
        let mut workers = self.workers.write().map_err(|_| Self::poisoned())?;
        let record = workers
            .get_mut(&id)
            .ok_or_else(|| QueueError::not_found(format!("worker {id}")))?;
        record.status = status;
        record.updated_at = now;
        Ok(())
    }

    async fn get(&self, id: WorkerId) -> QueueResult<Option<WorkerRecord>> {
        let workers = self.workers.read().map_err(|_| Self::poisoned())?;
        Ok(workers.get(&id).cloned())
    }

    async fn active(&self) -> QueueResult<Vec<WorkerRecord>> {
        self.sorted(|w| w.status.is_active())
    }

    async fn all(&self) -> QueueResult<Vec<WorkerRecord>> {
        self.sorted(|_| true)
    }
}
