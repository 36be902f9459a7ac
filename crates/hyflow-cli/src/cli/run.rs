//! `hyflow run` and `hyflow resume`.
//!
//! Both build an [`Engine`] against the SQLite checkpoint store, render
//! progress from the engine's event stream, and translate Ctrl+C into run
//! cancellation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use hyflow_core::Engine;
use hyflow_core::connector::ConnectorRegistry;
use hyflow_core::graph::load_workflow_file;
use hyflow_infra::deployment::{build_registry, load_deployments};
use hyflow_infra::sqlite::SqliteCheckpointStore;
use hyflow_types::deployment::DeploymentConfig;
use hyflow_types::event::EngineEvent;
use hyflow_types::execution::StepStatus;
use hyflow_types::report::RunReport;

use super::{Output, run_status_cell, step_status_cell, truncate};
use crate::state::AppState;

pub async fn run_workflow(state: &AppState, workflow: &Path, deployments: &Path, out: Output) -> Result<i32> {
    let definition =
        load_workflow_file(workflow).with_context(|| format!("Failed to load workflow {}", workflow.display()))?;
    let (deployments, registry) = prepare_deployments(state, deployments).await?;

    let engine = Engine::new(
        definition,
        deployments,
        Arc::new(registry),
        state.store.clone(),
        state.config.clone(),
    )
    .context("Failed to start run")?;

    execute(engine, out).await
}

pub async fn resume_run(
    state: &AppState,
    run_id: &str,
    deployments: &Path,
    workflow: Option<&Path>,
    out: Output,
) -> Result<i32> {
    let run_id: Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id}'"))?;

    let definition = match workflow {
        Some(path) => Some(
            load_workflow_file(path).with_context(|| format!("Failed to load workflow {}", path.display()))?,
        ),
        None => None,
    };
    let (deployments, registry) = prepare_deployments(state, deployments).await?;

    let engine = Engine::resume(
        run_id,
        definition,
        deployments,
        Arc::new(registry),
        state.store.clone(),
        state.config.clone(),
    )
    .await
    .with_context(|| format!("Failed to resume run {run_id}"))?;

    execute(engine, out).await
}

async fn prepare_deployments(
    state: &AppState,
    path: &Path,
) -> Result<(Vec<DeploymentConfig>, ConnectorRegistry)> {
    let deployments = load_deployments(path)
        .await
        .with_context(|| format!("Failed to load deployments {}", path.display()))?;
    let registry = build_registry(&deployments, &state.data_dir).context("Failed to set up connectors")?;
    Ok((deployments, registry))
}

async fn execute(engine: Engine<SqliteCheckpointStore>, out: Output) -> Result<i32> {
    let run_id = engine.run_id();
    let cancel = engine.cancellation_token();

    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                eprintln!(
                    "  {} Cancelling run {}...",
                    style("!").yellow().bold(),
                    style(run_id).cyan()
                );
                cancel.cancel();
            }
        }
    });

    let done = CancellationToken::new();
    let progress = out
        .styled()
        .then(|| tokio::spawn(render_progress(engine.subscribe(), done.clone())));

    let result = engine.run().await;

    interrupt.abort();
    done.cancel();
    if let Some(progress) = progress {
        let _ = progress.await;
    }

    let report = result.with_context(|| format!("Run {run_id} stopped"))?;
    print_report(&report, out)?;
    Ok(report.exit_code())
}

/// Print engine events until the run ends.
async fn render_progress(mut events: broadcast::Receiver<EngineEvent>, done: CancellationToken) {
    let spinner = ProgressBar::new_spinner();
    if let Ok(template) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        spinner.set_style(template);
    }
    spinner.enable_steady_tick(Duration::from_millis(80));

    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Ok(event) => show_event(&spinner, &event),
                Err(RecvError::Lagged(skipped)) => tracing::debug!(skipped, "progress display lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = done.cancelled() => {
                while let Ok(event) = events.try_recv() {
                    show_event(&spinner, &event);
                }
                break;
            }
        }
    }

    spinner.finish_and_clear();
}

fn show_event(spinner: &ProgressBar, event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted {
            run_id,
            workflow,
            resumed,
        } => {
            let verb = if *resumed { "Resuming" } else { "Running" };
            spinner.println(format!(
                "  {} {verb} '{}' ({})",
                style("*").green().bold(),
                style(workflow).cyan(),
                style(run_id).dim()
            ));
        }
        EngineEvent::StepStatusChanged { step, status } if status.is_terminal() => {
            let mark = match status {
                StepStatus::Completed => style("✓").green(),
                StepStatus::Failed => style("✗").red(),
                _ => style("-").dim(),
            };
            spinner.println(format!("  {mark} {step} {}", style(status).dim()));
        }
        EngineEvent::StepStatusChanged { step, status } => {
            spinner.set_message(format!("{step}: {status}"));
        }
        EngineEvent::InvocationFired { step, ordinal, tag } => {
            spinner.set_message(format!("{step}#{ordinal} fired (tag {tag})"));
        }
        EngineEvent::InvocationBound {
            step,
            ordinal,
            locations,
        } => {
            let locations: Vec<String> = locations.iter().map(ToString::to_string).collect();
            spinner.set_message(format!("{step}#{ordinal} bound to {}", locations.join(", ")));
        }
        EngineEvent::JobSubmitted {
            step,
            ordinal,
            job_id,
            attempt,
        } => {
            spinner.set_message(format!("{step}#{ordinal} submitted as {job_id} (attempt {attempt})"));
        }
        EngineEvent::InvocationFinished {
            step,
            ordinal,
            status: StepStatus::Failed,
            error,
        } => {
            spinner.println(format!(
                "  {} {step}#{ordinal} failed: {}",
                style("✗").red(),
                style(error.as_deref().unwrap_or("unknown error")).red()
            ));
        }
        EngineEvent::InvocationFinished {
            step,
            ordinal,
            status,
            ..
        } => {
            spinner.set_message(format!("{step}#{ordinal} {status}"));
        }
        EngineEvent::DataCopied {
            source,
            destination,
            bytes,
            ..
        } => {
            spinner.set_message(format!("copied {bytes} bytes {source} -> {destination}"));
        }
        EngineEvent::RunFinished { .. } => {}
    }
}

fn print_report(report: &RunReport, out: Output) -> Result<()> {
    if out.json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if out.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Invocations"),
            Cell::new("Failed"),
            Cell::new("Error"),
        ]);
    for step in &report.steps {
        table.add_row(vec![
            Cell::new(&step.step),
            step_status_cell(step.status),
            Cell::new(step.invocations),
            Cell::new(step.failed_invocations),
            Cell::new(step.error.as_deref().unwrap_or("-")),
        ]);
    }

    println!();
    println!("{table}");

    for (port, tokens) in &report.outputs {
        println!();
        println!("  {} {}", style("Output").bold(), style(port).cyan());
        for token in tokens {
            let value = token.payload.to_json().to_string();
            println!("    [{}] {}", token.tag, truncate(&value, 100));
        }
    }

    println!();
    let mut status_table = Table::new();
    status_table
        .load_preset(presets::NOTHING)
        .add_row(vec![Cell::new("Run"), Cell::new(report.run_id)])
        .add_row(vec![Cell::new("Status"), run_status_cell(report.status)])
        .add_row(vec![Cell::new("Transfers"), Cell::new(report.transfers)]);
    if let Some(error) = &report.error {
        status_table.add_row(vec![Cell::new("Error"), Cell::new(error).fg(Color::Red)]);
    }
    println!("{status_table}");
    println!();

    Ok(())
}
