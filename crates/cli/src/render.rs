//! Plain text rendering of queue data.

use std::fmt::Write;

use chrono::{DateTime, SecondsFormat, Utc};

use queuectl_core::{Job, JobState, JobStatus, WorkerRecord};
use queuectl_infra::QueueStatus;

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// One line per job: id, state, attempts, priority, command.
pub fn job_line(job: &Job) -> String {
    let mut line = format!(
        "{:<36}  {:<10}  {}/{}  p={:<4}  {}",
        job.id,
        job.status(),
        job.attempts,
        job.max_retries,
        job.priority,
        job.command
    );
    if let Some(run_at) = job.run_at() {
        let _ = write!(line, "  (run_at {})", ts(run_at));
    }
    line
}

/// Dead job with the reason it died.
pub fn dead_line(job: &Job) -> String {
    let reason = job.last_failure().map(|f| f.error.as_str()).unwrap_or("-");
    format!("{:<36}  {}/{}  {}  {}", job.id, job.attempts, job.max_retries, ts(job.updated_at), reason)
}

pub fn job_detail(job: &Job) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "id:          {}", job.id);
    let _ = writeln!(out, "command:     {}", job.command);
    let _ = writeln!(out, "state:       {}", job.status());
    let _ = writeln!(out, "attempts:    {}/{}", job.attempts, job.max_retries);
    let _ = writeln!(out, "priority:    {}", job.priority);
    let _ = writeln!(out, "created_at:  {}", ts(job.created_at));
    let _ = writeln!(out, "updated_at:  {}", ts(job.updated_at));
    if let Some(worker) = job.last_worker {
        let _ = writeln!(out, "worker:      {worker}");
    }

    let output = match &job.state {
        JobState::Pending { run_at, .. } => {
            if let Some(run_at) = run_at {
                let _ = writeln!(out, "run_at:      {}", ts(*run_at));
            }
            None
        }
        JobState::Processing { .. } => None,
        JobState::Completed { rc, output } => {
            let _ = writeln!(out, "last_rc:     {rc}");
            Some(output)
        }
        JobState::Dead { .. } => None,
    };

    let failure = job.last_failure();
    if let Some(failure) = failure {
        let _ = writeln!(out, "last_error:  {}", failure.error);
        if let Some(rc) = failure.rc {
            let _ = writeln!(out, "last_rc:     {rc}");
        }
    }

    if let Some(output) = output.or(failure.map(|f| &f.output)) {
        for (name, text) in [("stdout", &output.stdout), ("stderr", &output.stderr)] {
            if let Some(text) = text.as_deref().filter(|t| !t.is_empty()) {
                let _ = writeln!(out, "{name}:\n{}", text.trim_end());
            }
        }
    }
    out
}

fn worker_line(worker: &WorkerRecord) -> String {
    let pid = worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
    format!(
        "{}  pid={:<8}  {:<8}  since {}",
        worker.id,
        pid,
        worker.status,
        ts(worker.started_at)
    )
}

pub fn status_text(status: &QueueStatus) -> String {
    let mut out = String::from("jobs:\n");
    for state in JobStatus::ALL {
        let _ = writeln!(out, "  {:<10} {}", state.as_str(), status.jobs.get(state));
    }

    let active = status.workers.iter().filter(|w| w.status.is_active()).count();
    let _ = writeln!(out, "workers: {active} active, {} total", status.workers.len());
    for worker in &status.workers {
        let _ = writeln!(out, "  {}", worker_line(worker));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use queuectl_core::{Failure, JobId, Output, WorkerId, WorkerStatus};
    use queuectl_infra::JobCounts;

    fn dead_job() -> Job {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        Job {
            id: JobId::parse("j1").unwrap(),
            command: "exit 2".into(),
            attempts: 3,
            max_retries: 3,
            priority: 1,
            created_at: at,
            updated_at: at,
            state: JobState::Dead {
                failure: Failure {
                    error: "retries_exhausted: exit code 2".into(),
                    rc: Some(2),
                    output: Output {
                        stdout: Some(String::new()),
                        stderr: Some("nope\n".into()),
                    },
                },
            },
            last_worker: None,
        }
    }

    #[test]
    fn dead_line_shows_the_reason() {
        let line = dead_line(&dead_job());
        assert!(line.starts_with("j1 "));
        assert!(line.contains("3/3"));
        assert!(line.ends_with("retries_exhausted: exit code 2"));
    }

    #[test]
    fn detail_includes_diagnostics() {
        let text = job_detail(&dead_job());
        assert!(text.contains("state:       dead"));
        assert!(text.contains("last_rc:     2"));
        assert!(text.contains("stderr:\nnope"));
        assert!(!text.contains("stdout:"));
    }

    #[test]
    fn status_lists_every_state() {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let status = QueueStatus {
            jobs: JobCounts {
                pending: 2,
                dead: 1,
                ..Default::default()
            },
            workers: vec![WorkerRecord {
                id: WorkerId::new(),
                pid: Some(77),
                status: WorkerStatus::Running,
                started_at: at,
                updated_at: at,
            }],
        };
        let text = status_text(&status);
        for state in JobStatus::ALL {
            assert!(text.contains(state.as_str()));
        }
        assert!(text.contains("  pending    2"));
        assert!(text.contains("workers: 1 active, 1 total"));
        assert!(text.contains("pid=77"));
    }
}
