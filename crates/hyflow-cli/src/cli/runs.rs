//! `hyflow runs` and `hyflow report`: read-only views of the checkpoint
//! database.

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use hyflow_core::checkpoint::{CheckpointStore, Snapshot, load_snapshot};
use hyflow_types::execution::StepStatus;

use super::{Output, run_status_cell, step_status_cell, truncate};
use crate::state::AppState;

pub async fn list_runs(state: &AppState, limit: usize, out: Output) -> Result<i32> {
    let mut runs = state.store.list_runs().await.context("Failed to list runs")?;
    runs.truncate(limit);

    if out.json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(0);
    }
    if out.quiet {
        return Ok(0);
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded.");
        println!(
            "  Start one with: {}",
            style("hyflow run <workflow.yaml> -d <deployments.yaml>").dim()
        );
        println!();
        return Ok(0);
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Finished"),
            Cell::new("Error"),
        ]);

    for run in &runs {
        let finished = run
            .finished_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(run.run_id),
            Cell::new(&run.workflow_name),
            run_status_cell(run.status),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(finished),
            Cell::new(run.error.as_deref().map(|e| truncate(e, 40)).unwrap_or_else(|| "-".into())),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(0)
}

/// Step view reconstructed from checkpoints.
struct StepView {
    step: String,
    status: Option<StepStatus>,
    invocations: usize,
    failed: usize,
    reason: Option<String>,
}

fn step_views(snapshot: &Snapshot) -> Vec<StepView> {
    snapshot
        .run
        .workflow
        .steps
        .iter()
        .map(|def| {
            let invocations: Vec<_> = snapshot.invocations_of(&def.id).collect();
            let record = snapshot.steps.get(&def.id);
            StepView {
                step: def.id.clone(),
                status: record.map(|r| r.status),
                invocations: invocations.len(),
                failed: invocations.iter().filter(|i| i.status == StepStatus::Failed).count(),
                reason: record.and_then(|r| r.reason.clone()),
            }
        })
        .collect()
}

pub async fn show_report(state: &AppState, run_id: &str, out: Output) -> Result<i32> {
    let run_id: Uuid = run_id
        .parse()
        .with_context(|| format!("Invalid run ID: '{run_id}'"))?;
    let snapshot = load_snapshot(&state.store, run_id)
        .await
        .with_context(|| format!("Failed to load run {run_id}"))?;
    let steps = step_views(&snapshot);

    if out.json {
        let outputs: serde_json::Map<String, serde_json::Value> = snapshot
            .run
            .workflow
            .outputs
            .iter()
            .map(|port| {
                let tokens = snapshot.tokens_on(port);
                (port.clone(), serde_json::to_value(tokens).unwrap_or_default())
            })
            .collect();
        let report = serde_json::json!({
            "run_id": run_id,
            "workflow": snapshot.run.workflow.name,
            "status": snapshot.run.status,
            "started_at": snapshot.run.started_at.to_rfc3339(),
            "finished_at": snapshot.run.finished_at.map(|t| t.to_rfc3339()),
            "error": snapshot.run.error,
            "steps": steps.iter().map(|s| serde_json::json!({
                "step": s.step,
                "status": s.status,
                "invocations": s.invocations,
                "failed_invocations": s.failed,
                "reason": s.reason,
            })).collect::<Vec<_>>(),
            "outputs": outputs,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(0);
    }
    if out.quiet {
        return Ok(0);
    }

    println!();
    println!(
        "  {} Run {}",
        style("Workflow:").bold(),
        style(run_id).cyan()
    );
    println!("  Workflow: {}", style(&snapshot.run.workflow.name).cyan());
    println!("  Status: {}", snapshot.run.status);
    println!(
        "  Started: {}",
        snapshot.run.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(finished) = snapshot.run.finished_at {
        println!("  Finished: {}", finished.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(ref err) = snapshot.run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Invocations"),
            Cell::new("Failed"),
            Cell::new("Reason"),
        ]);
    for view in &steps {
        let status = match view.status {
            Some(status) => step_status_cell(status),
            None => Cell::new("pending").fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(&view.step),
            status,
            Cell::new(view.invocations),
            Cell::new(view.failed),
            Cell::new(view.reason.as_deref().unwrap_or("-")),
        ]);
    }
    println!("{table}");

    for port in &snapshot.run.workflow.outputs {
        let tokens = snapshot.tokens_on(port);
        if tokens.is_empty() {
            continue;
        }
        println!();
        println!("  {} {}", style("Output").bold(), style(port).cyan());
        for token in tokens {
            let value = token.payload.to_json().to_string();
            println!("    [{}] {}", token.tag, truncate(&value, 100));
        }
    }
    println!();

    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hyflow_core::checkpoint::{CheckpointManager, MemoryCheckpointStore};
    use hyflow_core::graph::parse_workflow_yaml;
    use hyflow_types::checkpoint::{InvocationRecord, RunRecord, StepRecord};
    use hyflow_types::execution::{InvocationKey, RunStatus};
    use hyflow_types::token::Tag;
    use std::collections::BTreeMap;

    const WORKFLOW: &str = r#"
name: pair
ports:
  - id: x
  - id: y
steps:
  - id: a
    outputs: [{ name: out, port: x }]
  - id: b
    inputs: [{ name: in, port: x }]
    outputs: [{ name: out, port: y }]
outputs: [y]
"#;

    fn invocation(step: &str, ordinal: u64, status: StepStatus) -> InvocationRecord {
        InvocationRecord {
            key: InvocationKey::new(step, ordinal),
            tag: Tag::root(),
            inputs: BTreeMap::new(),
            status,
            binding: None,
            job: None,
            attempt: 1,
            outputs: Vec::new(),
            error: None,
            released: status.is_terminal(),
        }
    }

    #[tokio::test]
    async fn step_views_combine_steps_and_invocations() {
        let store = MemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let manager = CheckpointManager::new(store.clone(), run_id);
        manager
            .record_run(&RunRecord {
                workflow: parse_workflow_yaml(WORKFLOW).unwrap(),
                status: RunStatus::Aborted,
                error: Some("disk full".into()),
                started_at: Utc::now(),
                finished_at: None,
            })
            .await
            .unwrap();
        manager
            .record_invocation(&invocation("a", 0, StepStatus::Completed))
            .await
            .unwrap();
        manager
            .record_step(
                "a",
                &StepRecord {
                    status: StepStatus::Completed,
                    reason: None,
                },
            )
            .await
            .unwrap();
        manager
            .record_invocation(&invocation("b", 0, StepStatus::Failed))
            .await
            .unwrap();

        let snapshot = load_snapshot(&store, run_id).await.unwrap();
        let views = step_views(&snapshot);
        assert_eq!(views.len(), 2);
        assert_eq!(views[0].status, Some(StepStatus::Completed));
        assert_eq!(views[0].invocations, 1);
        assert_eq!(views[1].status, None);
        assert_eq!(views[1].failed, 1);
    }
}
