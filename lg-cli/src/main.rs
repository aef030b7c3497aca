//! legionctl - command line client for legiond

mod cli;

use std::process::ExitCode;

use clap::Parser;
use lg_core::constants::logging;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli_args = cli::Cli::parse();

    // Diagnostics go to stderr so --json output stays clean
    let filter = EnvFilter::try_from_env(logging::CLI_ENV).unwrap_or_else(|_| EnvFilter::new(logging::CLI_DEFAULT));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli::run_cli(&cli_args) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
