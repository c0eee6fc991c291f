//! Apply the outcome of one execution attempt to a claimed job.
//!
//! The backoff base is read from the config store at the moment of
//! computation. The retry ceiling is the job's own `max_retries`, fixed when
//! it was enqueued.

use chrono::Utc;
use tracing::{info, warn};

use queuectl_core::{Job, JobState, JobStatus, Outcome, QueueError, QueueResult, Settlement};

use super::store::JobStore;
use crate::config_store::ConfigStore;

/// Settle a job whose command ran and reported `exit_code`.
pub async fn apply_outcome<S, C>(
    store: &S,
    config: &C,
    job: &Job,
    exit_code: i32,
    stdout: String,
    stderr: String,
) -> QueueResult<Job>
where
    S: JobStore + ?Sized,
    C: ConfigStore + ?Sized,
{
    let outcome = Outcome::Exited {
        code: exit_code,
        stdout,
        stderr,
    };
    apply(store, config, job, outcome).await
}

/// Settle a job whose command could not be started or observed.
pub async fn apply_execution_fault<S, C>(
    store: &S,
    config: &C,
    job: &Job,
    message: impl Into<String>,
) -> QueueResult<Job>
where
    S: JobStore + ?Sized,
    C: ConfigStore + ?Sized,
{
    let outcome = Outcome::Fault {
        message: message.into(),
    };
    apply(store, config, job, outcome).await
}

pub(crate) async fn apply<S, C>(store: &S, config: &C, job: &Job, outcome: Outcome) -> QueueResult<Job>
where
    S: JobStore + ?Sized,
    C: ConfigStore + ?Sized,
{
    let JobState::Processing { worker_id } = job.state else {
        return Err(QueueError::invalid_state(
            job.id.clone(),
            JobStatus::Processing,
            job.status(),
        ));
    };

    let policy = config.retry_policy().await?;
    let now = Utc::now();
    let settlement = policy.settle(job.attempts, job.max_retries, outcome, now);
    let settled = store.settle(&job.id, worker_id, &settlement, now).await?;

    match &settlement {
        Settlement::Completed { rc, .. } => {
            info!(job_id = %job.id, worker_id = %worker_id, rc, "job completed");
        }
        Settlement::Retry {
            attempts,
            run_at,
            failure,
        } => {
            warn!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempts,
                run_at = %run_at,
                error = %failure.error,
                "job failed, retry scheduled"
            );
        }
        Settlement::Dead { attempts, failure } => {
            warn!(
                job_id = %job.id,
                worker_id = %worker_id,
                attempts,
                error = %failure.error,
                "job moved to dead letter queue"
            );
        }
    }

    Ok(settled)
}
