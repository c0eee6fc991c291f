//! Worker registry records.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::id::WorkerId;

/// Lifecycle of a worker process.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    /// Registered by the supervisor, process not confirmed yet.
    Starting,
    Running,
    /// Stop observed, cleaning up.
    Stopping,
    Stopped,
}

impl WorkerStatus {
    pub const ALL: [WorkerStatus; 4] = [
        WorkerStatus::Starting,
        WorkerStatus::Running,
        WorkerStatus::Stopping,
        WorkerStatus::Stopped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "starting",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopping => "stopping",
            WorkerStatus::Stopped => "stopped",
        }
    }

    /// Whether the supervisor should signal this worker on stop.
    pub fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Starting | WorkerStatus::Running)
    }
}

impl core::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WorkerStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| QueueError::validation(format!("unknown worker status: {s}")))
    }
}

/// One row of the worker ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub id: WorkerId,
    /// OS process id, once known.
    pub pid: Option<u32>,
    pub status: WorkerStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
