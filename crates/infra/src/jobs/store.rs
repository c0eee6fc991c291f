//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use queuectl_core::{
    Job, JobId, JobState, JobStatus, NewJob, QueueError, QueueResult, Settlement, WorkerId,
};

/// Result of one select-then-compare-and-swap claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimAttempt {
    /// The candidate was still pending and is now held by the caller.
    Claimed(Job),
    /// Another claimant won the candidate; select again.
    Conflict,
    /// Nothing is eligible right now.
    Empty,
}

/// Ordering of the dead-letter listing.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum DeadLetterOrder {
    /// Most recently dead first.
    #[default]
    Newest,
    /// Highest priority first, then most recently dead.
    Priority,
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Pending => self.pending,
            JobStatus::Processing => self.processing,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
            JobStatus::Dead => self.dead,
        }
    }

    pub(crate) fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Dead => self.dead += n,
        }
    }

    pub fn total(&self) -> u64 {
        JobStatus::ALL.iter().map(|s| self.get(*s)).sum()
    }
}

/// Job store abstraction.
///
/// Every mutation is guarded by the job's current state: an operation whose
/// precondition does not hold returns `InvalidState` (or `NotFound`) and
/// leaves the job untouched.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new pending job.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Select the best eligible candidate (priority desc, created_at asc) and
    /// move it to `processing` only if it is still `pending`.
    async fn try_claim(&self, worker_id: WorkerId, now: DateTime<Utc>) -> QueueResult<ClaimAttempt>;

    /// Persist the outcome of an attempt. Requires the job to be `processing`
    /// and held by `worker_id`.
    async fn settle(
        &self,
        id: &JobId,
        worker_id: WorkerId,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> QueueResult<Job>;

    /// Move a `dead` job back to `pending` with a clean slate.
    async fn requeue_dead(&self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job>;

    /// Jobs ordered by creation, optionally filtered by state.
    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>>;

    async fn list_dead(&self, limit: usize, order: DeadLetterOrder) -> QueueResult<Vec<Job>>;

    async fn counts(&self) -> QueueResult<JobCounts>;
}

/// Apply a settlement to a job held by `worker_id`.
pub(crate) fn settled_state(job: &mut Job, settlement: &Settlement, now: DateTime<Utc>) {
    job.attempts = settlement.attempts_after(job.attempts);
    job.updated_at = now;
    job.state = match settlement.clone() {
        Settlement::Completed { rc, output } => JobState::Completed { rc, output },
        Settlement::Retry { run_at, failure, .. } => JobState::Pending {
            run_at: Some(run_at),
            last_failure: Some(failure),
        },
        Settlement::Dead { failure, .. } => JobState::Dead { failure },
    };
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn poisoned() -> QueueError {
        QueueError::storage("in-memory job store lock poisoned")
    }

    fn candidate(&self, now: DateTime<Utc>) -> QueueResult<Option<JobId>> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
                    .then(a.id.cmp(&b.id))
            })
            .map(|j| j.id.clone()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> QueueResult<Job> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(QueueError::AlreadyExists(job.id));
        }
        let job = job.into_job(now);
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        Ok(jobs.get(id).cloned())
    }

    async fn try_claim(&self, worker_id: WorkerId, now: DateTime<Utc>) -> QueueResult<ClaimAttempt> {
        let Some(id) = self.candidate(now)? else {
            return Ok(ClaimAttempt::Empty);
        };

        // The read lock was released: re-check the state before swapping.
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        match jobs.get_mut(&id) {
            Some(job) if job.is_claimable(now) => {
                job.state = JobState::Processing { worker_id };
                job.last_worker = Some(worker_id);
                job.updated_at = now;
                Ok(ClaimAttempt::Claimed(job.clone()))
            }
            _ => Ok(ClaimAttempt::Conflict),
        }
    }

    async fn settle(
        &self,
        id: &JobId,
        worker_id: WorkerId,
        settlement: &Settlement,
        now: DateTime<Utc>,
    ) -> QueueResult<Job> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(format!("job {id}")))?;

        match &job.state {
            JobState::Processing { worker_id: holder } if *holder == worker_id => {}
            other => {
                return Err(QueueError::invalid_state(
                    id.clone(),
                    JobStatus::Processing,
                    other.status(),
                ));
            }
        }

        settled_state(job, settlement, now);
        Ok(job.clone())
    }

    async fn requeue_dead(&self, id: &JobId, now: DateTime<Utc>) -> QueueResult<Job> {
        let mut jobs = self.jobs.write().map_err(|_| Self::poisoned())?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| QueueError::not_found(format!("job {id}")))?;

        if job.status() != JobStatus::Dead {
            return Err(QueueError::invalid_state(
                id.clone(),
                JobStatus::Dead,
                job.status(),
            ));
        }

        job.state = JobState::pending();
        job.attempts = 0;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn list(&self, status: Option<JobStatus>, limit: usize) -> QueueResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status() == s))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_dead(&self, limit: usize, order: DeadLetterOrder) -> QueueResult<Vec<Job>> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status() == JobStatus::Dead)
            .cloned()
            .collect();

        match order {
            DeadLetterOrder::Newest => result.sort_by(|a, b| b.updated_at.cmp(&a.updated_at)),
            DeadLetterOrder::Priority => result.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(b.updated_at.cmp(&a.updated_at))
            }),
        }
        result.truncate(limit);
        Ok(result)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let jobs = self.jobs.read().map_err(|_| Self::poisoned())?;
        let mut counts = JobCounts::default();
        for job in jobs.values() {
            counts.add(job.status(), 1);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use queuectl_core::{Failure, Output};

    fn new_job(id: &str, priority: i64) -> NewJob {
        NewJob {
            id: JobId::parse(id).unwrap(),
            command: "true".into(),
            max_retries: 3,
            priority,
            run_at: None,
        }
    }

    fn claimed(attempt: ClaimAttempt) -> Job {
        match attempt {
            ClaimAttempt::Claimed(job) => job,
            other => panic!("expected a claim, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_ids() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.insert(new_job("a", 0), now).await.unwrap();
        assert!(matches!(
            store.insert(new_job("a", 0), now).await,
            Err(QueueError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn claim_prefers_priority_then_age() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store.insert(new_job("old-low", 0), t0).await.unwrap();
        store.insert(new_job("new-high", 5), t0 + Duration::seconds(1)).await.unwrap();
        store.insert(new_job("newer-high", 5), t0 + Duration::seconds(2)).await.unwrap();

        let worker = WorkerId::new();
        let now = t0 + Duration::seconds(3);
        let order: Vec<String> = [
            store.try_claim(worker, now).await.unwrap(),
            store.try_claim(worker, now).await.unwrap(),
            store.try_claim(worker, now).await.unwrap(),
        ]
        .into_iter()
        .map(|a| claimed(a).id.to_string())
        .collect();

        assert_eq!(order, ["new-high", "newer-high", "old-low"]);
        assert_eq!(store.try_claim(worker, now).await.unwrap(), ClaimAttempt::Empty);
    }

    #[tokio::test]
    async fn settle_requires_the_holder() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job("a", 0), now).await.unwrap();
        let settlement = Settlement::Completed {
            rc: 0,
            output: Output::default(),
        };

        // not processing yet
        assert!(matches!(
            store.settle(&job.id, WorkerId::new(), &settlement, now).await,
            Err(QueueError::InvalidState { .. })
        ));

        let holder = WorkerId::new();
        claimed(store.try_claim(holder, now).await.unwrap());
        assert!(matches!(
            store.settle(&job.id, WorkerId::new(), &settlement, now).await,
            Err(QueueError::InvalidState { .. })
        ));

        let done = store.settle(&job.id, holder, &settlement, now).await.unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.last_worker, Some(holder));
    }

    #[tokio::test]
    async fn requeue_only_from_dead() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = store.insert(new_job("a", 0), now).await.unwrap();

        assert!(matches!(
            store.requeue_dead(&job.id, now).await,
            Err(QueueError::InvalidState { .. })
        ));
        assert!(matches!(
            store.requeue_dead(&JobId::parse("missing").unwrap(), now).await,
            Err(QueueError::NotFound(_))
        ));

        let worker = WorkerId::new();
        claimed(store.try_claim(worker, now).await.unwrap());
        let dead = Settlement::Dead {
            attempts: 3,
            failure: Failure {
                error: "retries_exhausted: exit code 1".into(),
                rc: Some(1),
                output: Output::default(),
            },
        };
        store.settle(&job.id, worker, &dead, now).await.unwrap();

        let requeued = store.requeue_dead(&job.id, now).await.unwrap();
        assert_eq!(requeued.state, JobState::pending());
        assert_eq!(requeued.attempts, 0);
    }

    #[tokio::test]
    async fn counts_track_states() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        for i in 0..5 {
            store.insert(new_job(&format!("j{i}"), 0), now).await.unwrap();
        }
        let worker = WorkerId::new();
        store.try_claim(worker, now).await.unwrap();
        store.try_claim(worker, now).await.unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 3);
        assert_eq!(counts.processing, 2);
        assert_eq!(counts.total(), 5);
    }
}
