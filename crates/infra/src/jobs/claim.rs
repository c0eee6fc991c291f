//! Claim protocol: select a candidate, compare-and-swap it to `processing`,
//! reselect on conflict.

use chrono::{DateTime, Utc};
use tracing::debug;

use queuectl_core::{Job, QueueResult, WorkerId};

use super::store::{ClaimAttempt, JobStore};

/// Claim the next eligible job for `worker_id`.
///
/// Returns `None` when nothing is eligible. A lost race is not reported; the
/// loop selects again, possibly landing on a later candidate.
pub async fn claim<S>(store: &S, worker_id: WorkerId, now: DateTime<Utc>) -> QueueResult<Option<Job>>
where
    S: JobStore + ?Sized,
{
    let mut conflicts = 0u32;
    loop {
        match store.try_claim(worker_id, now).await? {
            ClaimAttempt::Claimed(job) => {
                debug!(job_id = %job.id, worker_id = %worker_id, conflicts, "claimed job");
                return Ok(Some(job));
            }
            ClaimAttempt::Empty => return Ok(None),
            ClaimAttempt::Conflict => {
                conflicts += 1;
                debug!(worker_id = %worker_id, conflicts, "claim conflict, reselecting");
            }
        }
    }
}
