//! Dispatch of parsed commands onto `Queue` operations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;

use queuectl_core::{ConfigKey, JobId};
use queuectl_infra::{
    default_db_path, install_shutdown_handler, run_worker_process, Database, DetachedLauncher,
    Queue,
};

use crate::args::{Cli, Command, ConfigCommand, DlqCommand, WorkerCommand};
use crate::render;

/// `--db`, then `QUEUECTL_DB` (both via clap), then the platform data dir.
pub fn resolve_db_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .or_else(default_db_path)
        .context("cannot determine a data directory; pass --db or set QUEUECTL_DB")
}

pub async fn run(cli: Cli) -> Result<()> {
    let path = resolve_db_path(cli.db)?;

    // Worker processes own their database handle for their whole lifetime.
    if let Command::Worker(WorkerCommand::Run { id }) = cli.command {
        let db = Database::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let stats = run_worker_process(db, id, install_shutdown_handler()).await?;
        info!(worker_id = %id, processed = stats.jobs_processed, "worker exited");
        return Ok(());
    }

    let queue = Queue::open(&path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let result = dispatch(&queue, cli.command).await;
    queue.close().await;
    result
}

async fn dispatch(queue: &Queue, command: Command) -> Result<()> {
    match command {
        Command::Enqueue { payload } => {
            let job = queue.enqueue(&payload).await.context("enqueue rejected")?;
            println!("{}", job.id);
        }

        Command::Worker(WorkerCommand::Start { count }) => {
            let supervisor = queue.supervisor(DetachedLauncher::current_exe()?);
            let started = supervisor.start_workers(count).await?;
            println!("started {} worker(s)", started.len());
            for worker in started {
                let pid = worker.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into());
                println!("  {} pid={pid}", worker.id);
            }
        }

        Command::Worker(WorkerCommand::Stop) => {
            let report = queue
                .supervisor(DetachedLauncher::current_exe()?)
                .stop_workers()
                .await?;
            println!(
                "stop requested: {} signalled, {} already gone",
                report.signalled.len(),
                report.already_gone.len()
            );
        }

        // handled in `run`
        Command::Worker(WorkerCommand::Run { .. }) => {}

        Command::Status(output) => {
            let status = queue.status().await?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{}", render::status_text(&status));
            }
        }

        Command::List {
            state,
            limit,
            output,
        } => {
            let jobs = queue.list(state, limit).await?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in &jobs {
                    println!("{}", render::job_line(job));
                }
            }
        }

        Command::Show { id } => {
            let job = queue.get(&JobId::parse(id)?).await?;
            print!("{}", render::job_detail(&job));
        }

        Command::Dlq(DlqCommand::List {
            limit,
            order,
            output,
        }) => {
            let jobs = queue.list_dead(limit, order.into()).await?;
            if output.json {
                println!("{}", serde_json::to_string_pretty(&jobs)?);
            } else {
                for job in &jobs {
                    println!("{}", render::dead_line(job));
                }
            }
        }

        Command::Dlq(DlqCommand::Retry { id }) => {
            let job = queue
                .requeue(&JobId::parse(id)?)
                .await
                .context("dlq retry refused")?;
            println!("requeued {}", job.id);
        }

        Command::Config(ConfigCommand::Get { key }) => {
            println!("{}", queue.config_get(key).await?);
        }

        Command::Config(ConfigCommand::Set { key, value }) => {
            queue.config_set(key, &value).await?;
            println!("{key} = {}", queue.config_get(key).await?);
        }

        Command::Config(ConfigCommand::List) => {
            let entries = queue.config_list().await?;
            for key in ConfigKey::ALL {
                if !entries.iter().any(|(k, _)| k == key.as_str()) {
                    println!("{key} = {} (default)", key.default_value());
                }
            }
            for (key, value) in entries {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}
