//! `instruct-tune` binary.

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use instruct_tune::cli::{execute, Cli, Command};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let name = match &cli.command {
        Command::Train(_) => "train",
        Command::Validate(_) => "validate",
        Command::Init(_) => "init",
        Command::Merge(_) => "merge",
    };
    execute(cli).with_context(|| format!("{name} failed"))
}
