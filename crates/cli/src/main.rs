use std::process::ExitCode;

use clap::Parser;

use queuectl_cli::args::Cli;
use queuectl_observability::LogFormat;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = if cli.is_worker_process() {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    queuectl_observability::init(format);

    match queuectl_cli::run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
