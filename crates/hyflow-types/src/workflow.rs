//! Workflow graph definition types.
//!
//! A workflow is a set of steps connected by ports. Steps read from ports
//! through input slots and write to ports through output slots. The document
//! is produced by an external front end (or written by hand) as YAML or JSON.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deployment::ResourceVector;
use crate::token::{DataRef, Payload};

/// A complete workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Human-readable workflow name.
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Typed channels between steps.
    pub ports: Vec<PortDefinition>,

    pub steps: Vec<StepDefinition>,

    /// Initial tokens placed on ports before any step runs.
    #[serde(default)]
    pub inputs: Vec<WorkflowInput>,

    /// Ports whose tokens are the workflow's results.
    #[serde(default)]
    pub outputs: Vec<String>,
}

impl WorkflowDefinition {
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDefinition {
    pub id: String,
    #[serde(default = "default_type_tag")]
    pub type_tag: String,
}

fn default_type_tag() -> String {
    "any".to_string()
}

/// An initial token for a port. Exactly one of `value` or `data` is expected;
/// neither yields a `null` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub port: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DataRef>,
}

impl WorkflowInput {
    pub fn payload(&self) -> Payload {
        match (&self.data, &self.value) {
            (Some(data), _) => Payload::Data(data.clone()),
            (None, Some(value)) => Payload::Value(value.clone()),
            (None, None) => Payload::Value(Value::Null),
        }
    }
}

/// A schedulable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within the workflow.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: Vec<InputSlot>,

    #[serde(default)]
    pub outputs: Vec<OutputSlot>,

    /// How tokens from several input slots are combined into invocations.
    #[serde(default)]
    pub combinator: Combinator,

    /// Resources each invocation needs at every bound location.
    #[serde(default)]
    pub requirements: ResourceVector,

    #[serde(default)]
    pub binding: BindingPolicy,

    /// Opaque command handed to the connector.
    #[serde(default)]
    pub command: Value,

    /// Per-invocation job timeout in seconds. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl StepDefinition {
    pub fn is_scatter(&self) -> bool {
        self.inputs.iter().any(|s| s.mode == SlotMode::Scatter)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: String,
    pub port: String,
    /// Optional slots are satisfied by absence once their port closes.
    #[serde(default)]
    pub optional: bool,
    /// Skip this step (instead of failing it) when the slot's producer was
    /// skipped or failed without delivering anything.
    #[serde(default = "default_true")]
    pub propagate_skip: bool,
    #[serde(default)]
    pub mode: SlotMode,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSlot {
    pub name: String,
    pub port: String,
}

/// How a slot consumes its port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotMode {
    /// One token per invocation.
    #[default]
    Stream,
    /// Each token's items become separate invocations.
    Scatter,
    /// All tokens, once the port closes, as a single list.
    Gather,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    /// Invocations pair tokens whose tags match.
    #[default]
    DotProduct,
    /// Every combination of one token per slot is an invocation.
    CartesianProduct,
}

/// Placement constraints for a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingPolicy {
    /// Restrict to locations of this deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    /// Restrict to a location with this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// Number of distinct locations each invocation needs.
    #[serde(default = "default_locations")]
    pub locations: usize,
}

fn default_locations() -> usize {
    1
}

impl Default for BindingPolicy {
    fn default() -> Self {
        Self {
            deployment: None,
            location: None,
            locations: default_locations(),
        }
    }
}

/// Re-submission policy for jobs the connector reports as failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_defaults_from_minimal_yaml() {
        let yaml = r#"
id: align
inputs:
  - name: reads
    port: raw
outputs:
  - name: bam
    port: aligned
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.id, "align");
        assert!(step.inputs[0].propagate_skip);
        assert!(!step.inputs[0].optional);
        assert_eq!(step.inputs[0].mode, SlotMode::Stream);
        assert_eq!(step.combinator, Combinator::DotProduct);
        assert_eq!(step.binding.locations, 1);
        assert_eq!(step.retry.max_attempts, 1);
        assert!(step.timeout_secs.is_none());
        assert!(!step.is_scatter());
    }

    #[test]
    fn slot_modes_and_combinator_parse() {
        let yaml = r#"
id: s
combinator: cartesian_product
inputs:
  - { name: a, port: p, mode: scatter, propagate_skip: false }
  - { name: b, port: q, mode: gather, optional: true }
"#;
        let step: StepDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.combinator, Combinator::CartesianProduct);
        assert_eq!(step.inputs[0].mode, SlotMode::Scatter);
        assert!(!step.inputs[0].propagate_skip);
        assert_eq!(step.inputs[1].mode, SlotMode::Gather);
        assert!(step.inputs[1].optional);
        assert!(step.is_scatter());
    }

    #[test]
    fn workflow_input_payload() {
        let input = WorkflowInput {
            port: "p".into(),
            value: Some(serde_json::json!([1, 2])),
            data: None,
        };
        assert_eq!(input.payload(), Payload::Value(serde_json::json!([1, 2])));

        let empty = WorkflowInput {
            port: "p".into(),
            value: None,
            data: None,
        };
        assert_eq!(empty.payload(), Payload::Value(Value::Null));
    }
}
