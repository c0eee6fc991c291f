//! Job persistence, the claim protocol and outcome settlement.
//!
//! ## Components
//!
//! - `JobStore`: state-guarded persistence (SQLite or in-memory)
//! - `claim`: select-then-CAS loop over `JobStore::try_claim`
//! - `apply_outcome` / `apply_execution_fault`: retry policy applied to a claimed job
//! - `CommandRunner`: executes a job's command and reports an `Outcome`

pub mod claim;
pub mod executor;
pub mod settle;
pub mod sqlite;
pub mod store;

pub use claim::claim;
pub use executor::{CommandRunner, ShellRunner};
pub use settle::{apply_execution_fault, apply_outcome};
pub use sqlite::SqliteJobStore;
pub use store::{ClaimAttempt, DeadLetterOrder, InMemoryJobStore, JobCounts, JobStore};
