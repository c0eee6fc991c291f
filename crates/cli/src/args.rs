use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use queuectl_core::{ConfigKey, JobStatus, WorkerId};
use queuectl_infra::DeadLetterOrder;

#[derive(Parser, Debug)]
#[command(name = "queuectl", version, about = "Persistent background job queue")]
pub struct Cli {
    /// Queue database file.
    #[arg(long, env = "QUEUECTL_DB", global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Whether this invocation is a detached worker started by `worker start`.
    pub fn is_worker_process(&self) -> bool {
        matches!(self.command, Command::Worker(WorkerCommand::Run { .. }))
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Enqueue a job from a JSON payload: {"id"?, "command", "max_retries"?, "priority"?, "run_at"?}
    Enqueue { payload: String },

    /// Manage worker processes.
    #[command(subcommand)]
    Worker(WorkerCommand),

    /// Job counts per state and the worker ledger.
    Status(OutputArgs),

    /// List jobs, oldest first.
    List {
        #[arg(long)]
        state: Option<JobStatus>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[command(flatten)]
        output: OutputArgs,
    },

    /// Show one job.
    Show { id: String },

    /// Dead letter queue.
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Queue configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug, Clone, Copy, Default)]
pub struct OutputArgs {
    /// Print JSON instead of text.
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommand {
    /// Start detached worker processes.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Ask every running worker to exit after its current job.
    Stop,
    /// Run one worker in the foreground (spawned by `worker start`).
    #[command(hide = true)]
    Run {
        #[arg(long)]
        id: WorkerId,
    },
}

#[derive(Subcommand, Debug)]
pub enum DlqCommand {
    /// List dead jobs.
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = DlqOrder::Newest)]
        order: DlqOrder,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// Move a dead job back to pending.
    Retry { id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqOrder {
    Newest,
    Priority,
}

impl From<DlqOrder> for DeadLetterOrder {
    fn from(order: DlqOrder) -> Self {
        match order {
            DlqOrder::Newest => DeadLetterOrder::Newest,
            DlqOrder::Priority => DeadLetterOrder::Priority,
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    Get { key: ConfigKey },
    Set { key: ConfigKey, value: String },
    List,
}
