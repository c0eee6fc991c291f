//! Process supervision seam: start detached worker processes and signal them.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use queuectl_core::{QueueError, QueueResult, WorkerId};

/// Starts and signals worker processes.
pub trait ProcessLauncher: Send + Sync {
    /// Start a worker bound to `worker_id` and the database at `db_path`.
    /// Returns the OS process id. The process must outlive the caller.
    fn launch(&self, worker_id: WorkerId, db_path: &Path) -> QueueResult<u32>;

    /// Ask the process to terminate. `Ok(false)` when it no longer exists.
    fn terminate(&self, pid: u32) -> QueueResult<bool>;
}

/// Re-executes a binary as `<program> --db <path> worker run --id <id>`.
///
/// Output of each worker is appended to `<db dir>/logs/worker-<id>.log`.
#[derive(Debug, Clone)]
pub struct DetachedLauncher {
    program: PathBuf,
}

impl DetachedLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Launch workers with the currently running executable.
    pub fn current_exe() -> QueueResult<Self> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(|e| QueueError::storage(format!("cannot locate current executable: {e}")))
    }

    fn log_file(worker_id: WorkerId, db_path: &Path) -> QueueResult<std::fs::File> {
        let dir = db_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join("logs");
        std::fs::create_dir_all(&dir)
            .map_err(|e| QueueError::storage(format!("failed to create {}: {e}", dir.display())))?;

        let path = dir.join(format!("worker-{worker_id}.log"));
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| QueueError::storage(format!("failed to open {}: {e}", path.display())))
    }
}

impl ProcessLauncher for DetachedLauncher {
    fn launch(&self, worker_id: WorkerId, db_path: &Path) -> QueueResult<u32> {
        let log = Self::log_file(worker_id, db_path)?;
        let log_err = log
            .try_clone()
            .map_err(|e| QueueError::storage(format!("failed to clone log handle: {e}")))?;

        let mut command = Command::new(&self.program);
        command
            .arg("--db")
            .arg(db_path)
            .args(["worker", "run", "--id"])
            .arg(worker_id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        // Own process group: a Ctrl-C aimed at the launching shell does not reach workers.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let child = command.spawn().map_err(|e| {
            QueueError::storage(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        let pid = child.id();
        // Dropping the handle neither waits for nor kills the child.
        drop(child);

        info!(worker_id = %worker_id, pid, "worker process launched");
        Ok(pid)
    }

    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> QueueResult<bool> {
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| QueueError::storage(format!("failed to run kill: {e}")))?;
        debug!(pid, success = status.success(), "sent SIGTERM");
        Ok(status.success())
    }

    #[cfg(not(unix))]
    fn terminate(&self, pid: u32) -> QueueResult<bool> {
        let status = Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| QueueError::storage(format!("failed to run taskkill: {e}")))?;
        debug!(pid, success = status.success(), "sent termination request");
        Ok(status.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn terminating_a_missing_process_is_not_an_error() {
        let launcher = DetachedLauncher::new("/bin/true");
        // pid far above any default pid_max
        assert!(!launcher.terminate(999_999_999).unwrap());
    }

    #[test]
    fn log_file_lives_next_to_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let id = WorkerId::new();
        DetachedLauncher::log_file(id, &dir.path().join("q.db")).unwrap();
        assert!(dir.path().join("logs").join(format!("worker-{id}.log")).exists());
    }
}
