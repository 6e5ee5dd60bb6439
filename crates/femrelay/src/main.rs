//! femrelay - dispatch finite-element analysis jobs to remote worker nodes.

mod report;
mod service;

use clap::Parser;
use femrelay_cli::{Args, Command};
use miette::Result;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "femrelay=info";

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    match args.command {
        Command::Run(run) => service::run(run).await,
        Command::Check(check) => report::check_job(&check),
        Command::Transitions { status } => report::transitions(&status),
    }
}

/// `--log-level` wins over `RUST_LOG`, which wins over the default.
fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level).unwrap_or_else(|e| {
            eprintln!("Invalid log filter {:?} ({}), using {}", level, e, DEFAULT_LOG_FILTER);
            EnvFilter::new(DEFAULT_LOG_FILTER)
        }),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
