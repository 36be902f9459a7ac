//! CLI command definitions for the `hyflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod run;
pub mod runs;
pub mod validate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use hyflow_core::EngineError;
use hyflow_core::checkpoint::PersistenceError;
use hyflow_core::graph::WorkflowError;
use hyflow_infra::deployment::DeploymentError;
use hyflow_types::execution::{RunStatus, StepStatus};
use hyflow_types::report::{EXIT_FATAL, EXIT_INVALID};

/// Run scientific workflows across heterogeneous deployments.
#[derive(Parser)]
#[command(name = "hyflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Directory holding config.toml and the checkpoint database.
    #[arg(long, global = true, env = "HYFLOW_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Also export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow.
    Run {
        /// Workflow definition (YAML or JSON).
        workflow: PathBuf,

        /// Deployments file (YAML or TOML).
        #[arg(short, long)]
        deployments: PathBuf,
    },

    /// Continue an interrupted or aborted run from its checkpoint.
    Resume {
        /// Run UUID.
        run_id: String,

        /// Deployments file (YAML or TOML).
        #[arg(short, long)]
        deployments: PathBuf,

        /// Workflow definition to use instead of the checkpointed one.
        #[arg(long)]
        workflow: Option<PathBuf>,
    },

    /// Check a workflow (and optionally a deployments file) without running.
    Validate {
        /// Workflow definition (YAML or JSON).
        workflow: PathBuf,

        /// Also check step bindings against this deployments file.
        #[arg(short, long)]
        deployments: Option<PathBuf>,
    },

    /// List checkpointed runs, most recent first.
    #[command(alias = "ls")]
    Runs {
        /// Maximum number of runs to display.
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show the checkpointed state of a run.
    Report {
        /// Run UUID.
        run_id: String,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

/// Output flags shared by every handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    pub json: bool,
    pub quiet: bool,
}

impl Output {
    pub fn styled(&self) -> bool {
        !self.json && !self.quiet
    }
}

/// Input rejected by the CLI itself.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct InvalidInput(pub String);

/// Map a command error to the process exit code.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(engine) = cause.downcast_ref::<EngineError>() {
            return match engine {
                EngineError::Persistence(PersistenceError::RunNotFound(_)) => EXIT_INVALID,
                other => other.exit_code(),
            };
        }
        if let Some(PersistenceError::RunNotFound(_)) = cause.downcast_ref::<PersistenceError>() {
            return EXIT_INVALID;
        }
        if cause.is::<WorkflowError>()
            || cause.is::<DeploymentError>()
            || cause.is::<InvalidInput>()
            || cause.is::<uuid::Error>()
        {
            return EXIT_INVALID;
        }
    }
    EXIT_FATAL
}

pub fn run_status_cell(status: RunStatus) -> Cell {
    let color = match status {
        RunStatus::Completed => Color::Green,
        RunStatus::Running => Color::Yellow,
        RunStatus::Failed | RunStatus::Aborted => Color::Red,
        RunStatus::Cancelled => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped | StepStatus::Cancelled => Color::DarkGrey,
        _ => Color::Yellow,
    };
    Cell::new(status).fg(color)
}

/// Shorten `text` to at most `max` characters.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut short: String = text.chars().take(max.saturating_sub(3)).collect();
    short.push_str("...");
    short
}
