//! Runs a job's command through the platform shell.

use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use queuectl_core::Outcome;

/// Runs one command to completion.
///
/// Never fails: anything that prevents observing an exit code is reported as
/// [`Outcome::Fault`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &str) -> Outcome;
}

/// Runs commands as `<shell> <flag> <command>`.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
    flag: String,
}

impl Default for ShellRunner {
    fn default() -> Self {
        if cfg!(windows) {
            Self::new("cmd", "/C")
        } else {
            Self::new("sh", "-c")
        }
    }
}

impl ShellRunner {
    pub fn new(shell: impl Into<String>, flag: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            flag: flag.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, command: &str) -> Outcome {
        let output = Command::new(&self.shell)
            .arg(&self.flag)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return Outcome::Fault {
                    message: format!("failed to start command: {err}"),
                };
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(status = %output.status, "command finished");

        match output.status.code() {
            Some(code) => Outcome::Exited {
                code,
                stdout,
                stderr,
            },
            None => Outcome::Fault {
                message: describe_abnormal_exit(output.status),
            },
        }
    }
}

#[cfg(unix)]
fn describe_abnormal_exit(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;

    match status.signal() {
        Some(signal) => format!("terminated by signal {signal}"),
        None => format!("command ended without exit code: {status}"),
    }
}

#[cfg(not(unix))]
fn describe_abnormal_exit(status: ExitStatus) -> String {
    format!("command ended without exit code: {status}")
}
