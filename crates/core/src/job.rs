//! Job model and state machine.
//!
//! In memory a job carries an explicit tagged [`JobState`]: each state owns
//! exactly the fields that are meaningful for it, so a completed job cannot
//! hold a pending `run_at` and a pending job cannot claim a holder. Storage
//! collapses this into a flat row (see the infra crate) and rebuilds it on
//! read.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::id::{JobId, WorkerId};

/// Flat state discriminant, as persisted in the `state` column.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    /// Transient: only exists inside retry computation, never at rest.
    Failed,
    Dead,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "dead" => Ok(JobStatus::Dead),
            other => Err(QueueError::validation(format!("unknown job state: {other}"))),
        }
    }
}

/// Captured (already truncated) output of one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

/// Diagnostics of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub error: String,
    /// `None` when the command could not be started or observed.
    pub rc: Option<i32>,
    pub output: Output,
}

/// Tagged job state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed; after a failed attempt `last_failure` keeps its
    /// diagnostics and `run_at` holds the backoff deadline.
    Pending {
        run_at: Option<DateTime<Utc>>,
        last_failure: Option<Failure>,
    },
    /// Held by exactly one worker.
    Processing { worker_id: WorkerId },
    /// Terminal success.
    Completed { rc: i32, output: Output },
    /// Retries exhausted; only a DLQ requeue leaves this state.
    Dead { failure: Failure },
}

impl JobState {
    pub fn pending() -> Self {
        JobState::Pending {
            run_at: None,
            last_failure: None,
        }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            JobState::Pending { .. } => JobStatus::Pending,
            JobState::Processing { .. } => JobStatus::Processing,
            JobState::Completed { .. } => JobStatus::Completed,
            JobState::Dead { .. } => JobStatus::Dead,
        }
    }
}

/// A unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Opaque shell-executable string.
    pub command: String,
    pub attempts: u32,
    pub max_retries: u32,
    /// Higher claims first.
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: JobState,
    /// Worker that most recently held the job. Historical trace only; the
    /// current holder lives in [`JobState::Processing`].
    pub last_worker: Option<WorkerId>,
}

impl Job {
    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn run_at(&self) -> Option<DateTime<Utc>> {
        match &self.state {
            JobState::Pending { run_at, .. } => *run_at,
            _ => None,
        }
    }

    /// Pending and due at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match &self.state {
            JobState::Pending { run_at, .. } => run_at.is_none_or(|at| at <= now),
            _ => false,
        }
    }

    /// Retry ceiling reached.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_retries
    }

    /// Diagnostics of the most recent attempt, if any.
    pub fn last_failure(&self) -> Option<&Failure> {
        match &self.state {
            JobState::Pending { last_failure, .. } => last_failure.as_ref(),
            JobState::Dead { failure } => Some(failure),
            _ => None,
        }
    }
}

/// A validated submission, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: JobId,
    pub command: String,
    pub max_retries: u32,
    pub priority: i64,
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    /// Materialize the job in its initial `pending` state.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        Job {
            id: self.id,
            command: self.command,
            attempts: 0,
            max_retries: self.max_retries,
            priority: self.priority,
            created_at: now,
            updated_at: now,
            state: JobState::Pending {
                run_at: self.run_at,
                last_failure: None,
            },
            last_worker: None,
        }
    }
}
