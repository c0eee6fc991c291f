//! `queuectl-core` — job queue domain.
//!
//! This crate contains **pure domain** code (no storage, no processes): the
//! job state machine, the retry/backoff policy, submission validation, config
//! keys and the worker ledger types.

pub mod config;
pub mod error;
pub mod id;
pub mod job;
pub mod policy;
pub mod submission;
pub mod worker;

pub use config::ConfigKey;
pub use error::{QueueError, QueueResult};
pub use id::{JobId, WorkerId};
pub use job::{Failure, Job, JobState, JobStatus, NewJob, Output};
pub use policy::{Outcome, RetryPolicy, Settlement};
pub use submission::JobSubmission;
pub use worker::{WorkerRecord, WorkerStatus};
