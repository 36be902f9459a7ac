//! Workflow graph parsing and validation.
//!
//! Documents are YAML (JSON is accepted since it is a YAML subset). Parsing
//! goes through `serde_yaml_ng` and is always followed by
//! [`validate_definition`], which enforces the structural invariants the
//! engine relies on.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use hyflow_types::workflow::WorkflowDefinition;

use super::dag::validate_dag;

/// Errors related to workflow definitions.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("parse error: {0}")]
    ParseError(String),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("cycle detected: {0}")]
    CycleDetected(String),

    #[error("unknown port: {0}")]
    UnknownPort(String),
}

/// Parse a workflow document from YAML or JSON and validate it.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Load and validate a workflow document from disk.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

fn valid_identifier(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

/// Validate the structural invariants of a workflow graph.
///
/// - identifiers are non-empty and limited to `[A-Za-z0-9_.-]`
/// - step ids, port ids and slot names (per step and direction) are unique
/// - every slot and workflow output names a declared port
/// - every port has exactly one producer (a step output or a workflow input)
/// - every port has at least one consumer (a step input or a workflow output)
/// - per-step numeric settings are in range
/// - the step graph is acyclic
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if !valid_identifier(&def.name) {
        return Err(WorkflowError::ValidationError(format!(
            "workflow name '{}' is empty or contains invalid characters",
            def.name
        )));
    }

    if def.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "workflow must have at least one step".to_string(),
        ));
    }

    let mut ports = HashSet::new();
    for port in &def.ports {
        if !valid_identifier(&port.id) {
            return Err(WorkflowError::ValidationError(format!(
                "port id '{}' is empty or contains invalid characters",
                port.id
            )));
        }
        if !ports.insert(port.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate port ID: '{}'",
                port.id
            )));
        }
    }

    let mut step_ids = HashSet::new();
    for step in &def.steps {
        if !valid_identifier(&step.id) {
            return Err(WorkflowError::ValidationError(format!(
                "step id '{}' is empty or contains invalid characters",
                step.id
            )));
        }
        if !step_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "duplicate step ID: '{}'",
                step.id
            )));
        }
    }

    let mut producers: HashMap<&str, usize> = HashMap::new();
    let mut consumers: HashMap<&str, usize> = HashMap::new();

    for step in &def.steps {
        let mut input_names = HashSet::new();
        for slot in &step.inputs {
            if !input_names.insert(slot.name.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has duplicate input slot '{}'",
                    step.id, slot.name
                )));
            }
            if !ports.contains(slot.port.as_str()) {
                return Err(WorkflowError::UnknownPort(format!(
                    "step '{}' input '{}' reads unknown port '{}'",
                    step.id, slot.name, slot.port
                )));
            }
            *consumers.entry(slot.port.as_str()).or_default() += 1;
        }

        let mut output_names = HashSet::new();
        for slot in &step.outputs {
            if !output_names.insert(slot.name.as_str()) {
                return Err(WorkflowError::ValidationError(format!(
                    "step '{}' has duplicate output slot '{}'",
                    step.id, slot.name
                )));
            }
            if !ports.contains(slot.port.as_str()) {
                return Err(WorkflowError::UnknownPort(format!(
                    "step '{}' output '{}' writes unknown port '{}'",
                    step.id, slot.name, slot.port
                )));
            }
            *producers.entry(slot.port.as_str()).or_default() += 1;
        }

        if step.binding.locations == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' must bind at least one location",
                step.id
            )));
        }
        if step.retry.max_attempts == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' retry.max_attempts must be >= 1",
                step.id
            )));
        }
        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' timeout must be > 0",
                step.id
            )));
        }
        if step.requirements.cores < 0.0 || step.requirements.custom.values().any(|v| *v < 0.0) {
            return Err(WorkflowError::ValidationError(format!(
                "step '{}' has negative resource requirements",
                step.id
            )));
        }
    }

    for input in &def.inputs {
        if !ports.contains(input.port.as_str()) {
            return Err(WorkflowError::UnknownPort(format!(
                "workflow input targets unknown port '{}'",
                input.port
            )));
        }
        *producers.entry(input.port.as_str()).or_default() += 1;
    }

    for output in &def.outputs {
        if !ports.contains(output.as_str()) {
            return Err(WorkflowError::UnknownPort(format!(
                "workflow output names unknown port '{output}'"
            )));
        }
        *consumers.entry(output.as_str()).or_default() += 1;
    }

    for port in &def.ports {
        match producers.get(port.id.as_str()).copied().unwrap_or(0) {
            1 => {}
            0 => {
                return Err(WorkflowError::ValidationError(format!(
                    "port '{}' has no producer",
                    port.id
                )));
            }
            n => {
                return Err(WorkflowError::ValidationError(format!(
                    "port '{}' has {n} producers (exactly one required)",
                    port.id
                )));
            }
        }
        if consumers.get(port.id.as_str()).copied().unwrap_or(0) == 0 {
            return Err(WorkflowError::ValidationError(format!(
                "port '{}' has no consumer",
                port.id
            )));
        }
    }

    validate_dag(def)
}
