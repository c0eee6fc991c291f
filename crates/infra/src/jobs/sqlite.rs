//! SQLite-backed job store.
//!
//! The tagged [`JobState`] is collapsed into the flat `jobs` row here and
//! rebuilt on read. All guarded mutations are single conditional `UPDATE`
//! statements with `RETURNING`; an empty result means the precondition did
//! not hold, and a follow-up read classifies it as `NotFound` or
//! `InvalidState`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use queuectl_core::{
    Failure, Job, JobId, JobState, JobStatus, NewJob, Output, QueueError, QueueResult, Settlement,
    WorkerId,
};

use super::store::{ClaimAttempt, DeadLetterOrder, JobCounts, JobStore};
use crate::db::{decode_ts, encode_ts, is_unique_violation, map_sqlx_error, Database};

const COLUMNS: &str = "id, command, state, attempts, max_retries, priority, run_at, created_at, \
                       updated_at, last_error, last_rc, stdout, stderr, worker_id";

/// SQLite job store.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Explain why a guarded update matched no row.
    async fn precondition_failed(&self, id: &JobId, expected: JobStatus) -> QueueError {
        match self.get(id).await {
            Ok(Some(job)) => QueueError::invalid_state(id.clone(), expected, job.status()),
            Ok(None) => QueueError::not_found(format!("job {id}")),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, priority, run_at, created_at, updated_at)
            VALUES (?1, ?2, 'pending', 0, ?3, ?4, ?5, ?6, ?6)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(i64::from(job.max_retries))
        .bind(job.priority)
        .bind(job.run_at.map(encode_ts))
        .bind(encode_ts(now))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::AlreadyExists(job.id.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        let job = JobRow::decode(&row)?.into_job()?;
        debug!(job_id = %job.id, priority = job.priority, "job enqueued");
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|r| JobRow::decode(&r)?.into_job()).transpose()
    }

    #[instrument(skip(self), fields(worker_id = %worker_id), err)]
    async fn try_claim(&self, worker_id: WorkerId, now: DateTime<Utc>) -> QueueResult<ClaimAttempt> {
        let now = encode_ts(now);

        let candidate: Option<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE state = 'pending' AND (run_at IS NULL OR run_at <= ?1)
            ORDER BY priority DESC, created_at ASC, id ASC
            LIMIT 1
            "#,
        )
        .bind(&now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_candidate", e))?;

        let Some(candidate) = candidate else {
            return Ok(ClaimAttempt::Empty);
        };

        // Compare-and-swap: only a row that is still pending and due moves.
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'processing', worker_id = ?1, updated_at = ?2
            WHERE id = ?3 AND state = 'pending' AND (run_at IS NULL OR run_at <= ?2)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(worker_id.to_string())
        .bind(&now)
        .bind(&candidate)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_job", e))?;

        match row {
            Some(row) => Ok(ClaimAttempt::Claimed(JobRow::decode(&row)?.into_job()?)),
            None => Ok(ClaimAttempt::Conflict),
        }
    }

    #[instrument(skip(self, settlement), fields(job_id = %id, worker_id = %worker_id, outcome = %settlement.status()), err)]
    async fn settle(
        &self,
        id: &JobId,
        worker_id: WorkerId,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let (attempts, run_at, last_error, last_rc, output) = match settlement {
            Settlement::Completed { rc, output } => (None, None, None, Some(*rc), output),
            Settlement::Retry {
                attempts,
                run_at,
                failure,
            } => (
                Some(*attempts),
                Some(encode_ts(*run_at)),
                Some(failure.error.as_str()),
                failure.rc,
                &failure.output,
            ),
            Settlement::Dead { attempts, failure } => (
                Some(*attempts),
                None,
                Some(failure.error.as_str()),
                failure.rc,
                &failure.output,
            ),
        };

        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = ?1,
                attempts = COALESCE(?2, attempts),
                run_at = ?3,
                last_error = ?4,
                last_rc = ?5,
                stdout = ?6,
                stderr = ?7,
                updated_at = ?8
            WHERE id = ?9 AND state = 'processing' AND worker_id = ?10
            RETURNING {COLUMNS}
            "#
        ))
        .bind(settlement.status().as_str())
        .bind(attempts.map(i64::from))
        .bind(run_at)
        .bind(last_error)
        .bind(last_rc)
        .bind(output.stdout.as_deref())
        .bind(output.stderr.as_deref())
        .bind(encode_ts(now))
        .bind(id.as_str())
        .bind(worker_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("settle_job", e))?;

        match row {
            Some(row) => JobRow::decode(&row)?.into_job(),
            None => Err(self.precondition_failed(id, JobStatus::Processing).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn requeue_dead(&self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = 0,
                run_at = NULL,
                last_error = NULL,
                last_rc = NULL,
                stdout = NULL,
                stderr = NULL,
                updated_at = ?1
            WHERE id = ?2 AND state = 'dead'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(encode_ts(now))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_job", e))?;

        match row {
            Some(row) => JobRow::decode(&row)?.into_job(),
            None => Err(self.precondition_failed(id, JobStatus::Dead).await),
        }
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let sql = format!(
            "SELECT {COLUMNS} FROM jobs WHERE (?1 IS NULL OR state = ?1) \
             ORDER BY created_at ASC, id ASC LIMIT ?2"
        );
        let rows = sqlx::query(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;
        decode_all(&rows)
    }

    async fn list_dead(&self, limit: usize, order: DeadLetterOrder) -> QueueResult<Vec<Job>> {
        let order_by = match order {
            DeadLetterOrder::Newest => "updated_at DESC, id ASC",
            DeadLetterOrder::Priority => "priority DESC, updated_at DESC, id ASC",
        };
        let sql = format!("SELECT {COLUMNS} FROM jobs WHERE state = 'dead' ORDER BY {order_by} LIMIT ?1");
        let rows = sqlx::query(&sql)
            .bind(limit_param(limit))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_dead", e))?;
        decode_all(&rows)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("count_jobs", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_jobs", e))?;
            counts.add(state.parse()?, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

fn decode_all(rows: &[SqliteRow]) -> QueueResult<Vec<Job>> {
    rows.iter().map(|row| JobRow::decode(row)?.into_job()).collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Flat `jobs` row.
#[derive(Debug)]
struct JobRow {
    id: String,
    command: String,
    state: String,
    attempts: i64,
    max_retries: i64,
    priority: i64,
    run_at: Option<String>,
    created_at: String,
    updated_at: String,
    last_error: Option<String>,
    last_rc: Option<i64>,
    stdout: Option<String>,
    stderr: Option<String>,
    worker_id: Option<String>,
}

impl JobRow {
    fn decode(row: &SqliteRow) -> QueueResult<Self> {
        let get = |e: sqlx::Error| map_sqlx_error("decode_job", e);
        Ok(Self {
            id: row.try_get("id").map_err(get)?,
            command: row.try_get("command").map_err(get)?,
            state: row.try_get("state").map_err(get)?,
            attempts: row.try_get("attempts").map_err(get)?,
            max_retries: row.try_get("max_retries").map_err(get)?,
            priority: row.try_get("priority").map_err(get)?,
            run_at: row.try_get("run_at").map_err(get)?,
            created_at: row.try_get("created_at").map_err(get)?,
            updated_at: row.try_get("updated_at").map_err(get)?,
            last_error: row.try_get("last_error").map_err(get)?,
            last_rc: row.try_get("last_rc").map_err(get)?,
            stdout: row.try_get("stdout").map_err(get)?,
            stderr: row.try_get("stderr").map_err(get)?,
            worker_id: row.try_get("worker_id").map_err(get)?,
        })
    }

    /// Rebuild the tagged state, rejecting combinations the model forbids.
    fn into_job(self) -> QueueResult<Job> {
        let id = JobId::parse(&self.id)?;
        let corrupt = |what: &str| QueueError::storage(format!("job {id}: {what}"));

        let last_worker = self.worker_id.as_deref().map(str::parse::<WorkerId>).transpose()?;
        let last_rc = self
            .last_rc
            .map(i32::try_from)
            .transpose()
            .map_err(|_| corrupt("last_rc out of range"))?;
        let output = Output {
            stdout: self.stdout,
            stderr: self.stderr,
        };
        let failure = self.last_error.map(|error| Failure {
            error,
            rc: last_rc,
            output: output.clone(),
        });

        let state = match self.state.parse::<JobStatus>()? {
            JobStatus::Pending => JobState::Pending {
                run_at: self
                    .run_at
                    .as_deref()
                    .map(|raw| decode_ts("run_at", raw))
                    .transpose()?,
                last_failure: failure,
            },
            JobStatus::Processing => JobState::Processing {
                worker_id: last_worker.ok_or_else(|| corrupt("processing without worker_id"))?,
            },
            JobStatus::Completed => JobState::Completed {
                rc: last_rc.unwrap_or(0),
                output,
            },
            JobStatus::Dead => JobState::Dead {
                failure: failure.ok_or_else(|| corrupt("dead without last_error"))?,
            },
            JobStatus::Failed => return Err(corrupt("persisted in transient state failed")),
        };

        Ok(Job {
            attempts: u32::try_from(self.attempts).map_err(|_| corrupt("attempts out of range"))?,
            max_retries: u32::try_from(self.max_retries)
                .map_err(|_| corrupt("max_retries out of range"))?,
            priority: self.priority,
            created_at: decode_ts("created_at", &self.created_at)?,
            updated_at: decode_ts("updated_at", &self.updated_at)?,
            command: self.command,
            state,
            last_worker,
            id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use queuectl_core::{Outcome, RetryPolicy};

    async fn store() -> (tempfile::TempDir, SqliteJobStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("queue.db")).await.unwrap();
        (dir, SqliteJobStore::new(&db))
    }

    fn new_job(id: &str) -> NewJob {
        NewJob {
            id: JobId::parse(id).unwrap(),
            command: "echo hi".into(),
            max_retries: 2,
            priority: 0,
            run_at: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let inserted = store.insert(new_job("a"), now).await.unwrap();
        let loaded = store.get(&inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded.command, "echo hi");
        assert_eq!(loaded.state, JobState::pending());
        assert_eq!(loaded.created_at, inserted.created_at);

        assert!(matches!(
            store.insert(new_job("a"), now).await,
            Err(QueueError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn retry_then_dead_persists_diagnostics() {
        let (_dir, store) = store().await;
        let now = Utc::now();
        let job = store.insert(new_job("a"), now).await.unwrap();
        let worker = WorkerId::new();
        let policy = RetryPolicy::default();
        let failing = || Outcome::Exited {
            code: 3,
            stdout: String::new(),
            stderr: "nope".into(),
        };

        let ClaimAttempt::Claimed(held) = store.try_claim(worker, now).await.unwrap() else {
            panic!("expected claim");
        };
        let retry = policy.settle(held.attempts, held.max_retries, failing(), now);
        let pending = store.settle(&job.id, worker, &retry, now).await.unwrap();
        assert_eq!(pending.attempts, 1);
        let due = decode_ts("run_at", &encode_ts(now + Duration::seconds(2))).unwrap();
        assert_eq!(pending.run_at(), Some(due));
        assert_eq!(pending.last_failure().unwrap().rc, Some(3));
        assert_eq!(pending.last_worker, Some(worker));

        // not due yet
        assert_eq!(store.try_claim(worker, now).await.unwrap(), ClaimAttempt::Empty);

        let later = now + Duration::seconds(3);
        let ClaimAttempt::Claimed(held) = store.try_claim(worker, later).await.unwrap() else {
            panic!("expected claim");
        };
        let dead = policy.settle(held.attempts, held.max_retries, failing(), later);
        let dead = store.settle(&job.id, worker, &dead, later).await.unwrap();
        assert_eq!(dead.status(), JobStatus::Dead);
        assert_eq!(dead.attempts, 2);
        assert!(dead.last_failure().unwrap().error.starts_with("retries_exhausted"));
        assert_eq!(dead.run_at(), None);
    }

    #[tokio::test]
    async fn settle_on_non_processing_job_is_refused() {
        let (_dir, store) = store().await;
        let job = store.insert(new_job("a"), Utc::now()).await.unwrap();
        let settlement = Settlement::Completed {
            rc: 0,
            output: Output::default(),
        };
        let err = store
            .settle(&job.id, WorkerId::new(), &settlement, Utc::now())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            QueueError::invalid_state(job.id.clone(), JobStatus::Processing, JobStatus::Pending)
        );
        assert_eq!(store.get(&job.id).await.unwrap().unwrap().state, JobState::pending());
    }

    #[tokio::test]
    async fn list_and_counts() {
        let (_dir, store) = store().await;
        let t0 = Utc::now();
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            store.insert(new_job(id), t0 + Duration::milliseconds(i as i64)).await.unwrap();
        }
        store.try_claim(WorkerId::new(), t0 + Duration::seconds(1)).await.unwrap();

        let all = store.list(None, 10).await.unwrap();
        assert_eq!(all.iter().map(|j| j.id.as_str()).collect::<Vec<_>>(), ["a", "b", "c"]);
        let pending = store.list(Some(JobStatus::Pending), 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(store.list(None, 1).await.unwrap().len(), 1);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.processing, 1);
        assert_eq!(counts.dead, 0);
    }

    #[tokio::test]
    async fn dead_letter_listing_orders_and_limits() {
        let (_dir, store) = store().await;
        let t0 = Utc::now();
        let worker = WorkerId::new();
        let dead = Settlement::Dead {
            attempts: 1,
            failure: Failure {
                error: "retries_exhausted: exit code 1".into(),
                rc: Some(1),
                output: Output::default(),
            },
        };

        // (id, priority, seconds after t0 at which it died)
        for (id, priority, died) in [("low", 0, 1), ("high", 9, 2), ("mid", 5, 3)] {
            let at = t0 + Duration::seconds(died);
            store
                .insert(NewJob { priority, ..new_job(id) }, t0)
                .await
                .unwrap();
            let ClaimAttempt::Claimed(held) = store.try_claim(worker, at).await.unwrap() else {
                panic!("expected claim");
            };
            store.settle(&held.id, worker, &dead, at).await.unwrap();
        }

        let ids = |jobs: Vec<Job>| jobs.into_iter().map(|j| j.id.to_string()).collect::<Vec<_>>();
        assert_eq!(
            ids(store.list_dead(10, DeadLetterOrder::Newest).await.unwrap()),
            ["mid", "high", "low"]
        );
        assert_eq!(
            ids(store.list_dead(10, DeadLetterOrder::Priority).await.unwrap()),
            ["high", "mid", "low"]
        );
        assert_eq!(
            ids(store.list_dead(2, DeadLetterOrder::Newest).await.unwrap()),
            ["mid", "high"]
        );
        assert_eq!(
            ids(store.list_dead(1, DeadLetterOrder::Priority).await.unwrap()),
            ["high"]
        );
    }
}
