//! `hyflow validate`: static checks without touching the data directory.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;

use hyflow_core::graph::dag::topological_order;
use hyflow_core::graph::load_workflow_file;
use hyflow_infra::deployment::load_deployments;
use hyflow_types::deployment::DeploymentConfig;
use hyflow_types::report::EXIT_SUCCESS;
use hyflow_types::workflow::WorkflowDefinition;

use super::{InvalidInput, Output};

pub async fn validate(workflow: &Path, deployments: Option<&Path>, out: Output) -> Result<i32> {
    let definition =
        load_workflow_file(workflow).with_context(|| format!("Failed to load workflow {}", workflow.display()))?;
    let order = topological_order(&definition)?;

    let deployment_count = match deployments {
        Some(path) => {
            let deployments = load_deployments(path)
                .await
                .with_context(|| format!("Failed to load deployments {}", path.display()))?;
            check_bindings(&definition, &deployments)?;
            Some(deployments.len())
        }
        None => None,
    };

    if out.json {
        let result = serde_json::json!({
            "valid": true,
            "name": definition.name,
            "steps": definition.steps.len(),
            "ports": definition.ports.len(),
            "order": order,
            "deployments": deployment_count,
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(EXIT_SUCCESS);
    }
    if out.quiet {
        return Ok(EXIT_SUCCESS);
    }

    println!();
    println!(
        "  {} Workflow '{}' is valid",
        style("✓").green().bold(),
        style(&definition.name).cyan()
    );
    println!("  Steps: {}", definition.steps.len());
    println!("  Ports: {}", definition.ports.len());
    println!("  Order: {}", style(order.join(" -> ")).dim());
    if let Some(count) = deployment_count {
        println!("  Deployments: {count}");
    }
    println!();

    Ok(EXIT_SUCCESS)
}

/// Every binding constraint must name a configured deployment and location.
fn check_bindings(definition: &WorkflowDefinition, deployments: &[DeploymentConfig]) -> Result<(), InvalidInput> {
    let total_locations: usize = deployments.iter().map(|d| d.locations.len()).sum();

    for step in &definition.steps {
        let policy = &step.binding;
        let candidates: Vec<&DeploymentConfig> = match &policy.deployment {
            Some(name) => {
                let found: Vec<_> = deployments.iter().filter(|d| &d.name == name).collect();
                if found.is_empty() {
                    return Err(InvalidInput(format!(
                        "step '{}' is bound to unknown deployment '{name}'",
                        step.id
                    )));
                }
                found
            }
            None => deployments.iter().collect(),
        };

        if let Some(location) = &policy.location {
            let known = candidates
                .iter()
                .any(|d| d.locations.iter().any(|l| &l.name == location));
            if !known {
                return Err(InvalidInput(format!(
                    "step '{}' is bound to unknown location '{location}'",
                    step.id
                )));
            }
        }

        let available = if policy.location.is_some() {
            1
        } else if policy.deployment.is_some() {
            candidates.iter().map(|d| d.locations.len()).sum()
        } else {
            total_locations
        };
        if policy.locations > available {
            return Err(InvalidInput(format!(
                "step '{}' needs {} locations but only {available} are configured",
                step.id, policy.locations
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_core::graph::parse_workflow_yaml;
    use hyflow_types::deployment::{LocationConfig, ResourceVector};
    use serde_json::Value;

    fn deployment(name: &str, locations: &[&str]) -> DeploymentConfig {
        DeploymentConfig {
            name: name.into(),
            connector: "local".into(),
            config: Value::Null,
            locations: locations
                .iter()
                .map(|l| LocationConfig {
                    name: l.to_string(),
                    capacity: ResourceVector::default(),
                })
                .collect(),
        }
    }

    fn workflow(binding: &str) -> WorkflowDefinition {
        parse_workflow_yaml(&format!(
            r#"
name: single
ports: [{{id: out}}]
outputs: [out]
steps:
  - id: a
    binding: {binding}
    outputs: [{{name: y, port: out}}]
"#
        ))
        .unwrap()
    }

    #[test]
    fn accepts_known_targets() {
        let deployments = [deployment("hpc", &["n1", "n2"]), deployment("cloud", &["vm"])];
        assert!(check_bindings(&workflow("{}"), &deployments).is_ok());
        assert!(check_bindings(&workflow("{deployment: hpc, locations: 2}"), &deployments).is_ok());
        assert!(check_bindings(&workflow("{deployment: cloud, location: vm}"), &deployments).is_ok());
    }

    #[test]
    fn rejects_unknown_targets() {
        let deployments = [deployment("hpc", &["n1", "n2"])];
        assert!(check_bindings(&workflow("{deployment: cloud}"), &deployments).is_err());
        assert!(check_bindings(&workflow("{deployment: hpc, location: n9}"), &deployments).is_err());
        assert!(check_bindings(&workflow("{locations: 3}"), &deployments).is_err());
    }

    #[tokio::test]
    async fn invalid_workflow_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wf.yaml");
        tokio::fs::write(&path, "name: broken\nsteps: [").await.unwrap();
        let err = validate(&path, None, Output::default()).await.unwrap_err();
        assert_eq!(crate::cli::exit_code_for(&err), hyflow_types::report::EXIT_INVALID);
    }
}
