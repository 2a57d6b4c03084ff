//! `gitlab-util`: review GitLab merge request diffs once and let the
//! scheduler approve and merge them when GitLab reports them ready.

mod bootstrap;
mod cli_args;
mod commands;
mod console;
mod credentials;
mod render;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::cli_args::{Cli, Command};
use crate::commands::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_file = match &cli.command {
        Command::AutoMerge(args) => args.log_file.clone(),
        _ => None,
    };
    init_tracing(log_file.as_deref())?;
    run_cli(cli).await
}
