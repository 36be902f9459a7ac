//! hyflow command-line entry point.
//!
//! Binary name: `hyflow`
//!
//! Parses CLI arguments, sets up tracing, opens the checkpoint database when
//! the command needs it, and dispatches to the command handlers. The process
//! exit code reflects the run outcome.

mod cli;
mod state;

use std::process::ExitCode;

use clap::Parser;
use clap_complete::generate;
use console::style;
use hyflow_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};
use hyflow_types::report::{EXIT_FATAL, EXIT_SUCCESS};

use cli::{Cli, Commands, Output};
use state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("  {} {err:#}", style("error:").red().bold());
            cli::exit_code_for(&err)
        }
    };

    shutdown_tracing();
    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FATAL as u8))
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let out = Output {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        // Neither completions nor validation touch the data directory
        Commands::Completions { shell } => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            generate(shell, &mut cmd, "hyflow", &mut std::io::stdout());
            Ok(EXIT_SUCCESS)
        }

        Commands::Validate {
            workflow,
            deployments,
        } => cli::validate::validate(&workflow, deployments.as_deref(), out).await,

        Commands::Run {
            workflow,
            deployments,
        } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::run::run_workflow(&state, &workflow, &deployments, out).await
        }

        Commands::Resume {
            run_id,
            deployments,
            workflow,
        } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::run::resume_run(&state, &run_id, &deployments, workflow.as_deref(), out).await
        }

        Commands::Runs { limit } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::runs::list_runs(&state, limit, out).await
        }

        Commands::Report { run_id } => {
            let state = AppState::init(cli.data_dir).await?;
            cli::runs::show_report(&state, &run_id, out).await
        }
    }
}
