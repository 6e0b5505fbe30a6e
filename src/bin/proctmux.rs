//! Entry point: parses the command line and either performs a one-shot
//! signal command or runs one of the long-lived modes.

use clap::Parser;
use proctmux::cli::{Cli, Command, Mode};
use proctmux::run::{self, RunError};
use std::process::ExitCode;
use tracing::error;

fn main() -> ExitCode {
    // clap exits with code 2 on its own for parse errors
    let cli = Cli::parse();

    match dispatch(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "proctmux exited with an error");
            eprintln!("proctmux: {err}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: &Cli) -> Result<(), RunError> {
    if let Some(command) = &cli.command {
        if *command != Command::Start {
            return run::run_signal(cli, command);
        }
    }
    match cli.effective_mode() {
        Mode::Client => run::run_client(cli),
        Mode::Primary => {
            if cli.unified_placement().is_some() {
                run::run_unified(cli)
            } else {
                run::run_primary(cli)
            }
        }
    }
}
