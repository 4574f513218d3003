use std::process::ExitCode;

use clap::Parser;
use cli::MoleCli;
use commands::Context;
use config::MolePaths;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod definition;
mod remote;
mod sync;

#[tokio::main]
pub async fn main() -> ExitCode {
    let cli = MoleCli::parse();
    let default_level = if cli.debug { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match MolePaths::from_home(cli.home) {
        Ok(paths) => match Context::load(paths) {
            Ok(context) => commands::run(cli.command, context).await,
            Err(e) => Err(e),
        },
        Err(e) => Err(e.into()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
