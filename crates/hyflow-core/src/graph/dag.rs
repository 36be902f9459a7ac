//! Step dependency graph and cycle detection.
//!
//! Steps are connected through ports: a step that writes a port precedes
//! every step that reads it. `petgraph` models these edges, and its
//! topological sort rejects cycles (self-loops included).

use std::collections::HashMap;

use hyflow_types::workflow::WorkflowDefinition;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::definition::WorkflowError;

fn build_step_graph(def: &WorkflowDefinition) -> (DiGraph<&str, ()>, Vec<NodeIndex>) {
    let mut graph = DiGraph::<&str, ()>::new();
    let nodes: Vec<_> = def.steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    let mut producer_of: HashMap<&str, usize> = HashMap::new();
    for (idx, step) in def.steps.iter().enumerate() {
        for slot in &step.outputs {
            producer_of.insert(slot.port.as_str(), idx);
        }
    }

    for (to, step) in def.steps.iter().enumerate() {
        for slot in &step.inputs {
            if let Some(&from) = producer_of.get(slot.port.as_str()) {
                graph.update_edge(nodes[from], nodes[to], ());
            }
        }
    }

    (graph, nodes)
}

/// Validate that the step graph is acyclic.
pub fn validate_dag(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    topological_order(def).map(|_| ())
}

/// Step ids in an order where every producer precedes its consumers.
pub fn topological_order(def: &WorkflowDefinition) -> Result<Vec<String>, WorkflowError> {
    let (graph, _) = build_step_graph(def);
    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        WorkflowError::CycleDetected(format!("cycle detected involving step '{node_id}'"))
    })?;
    Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::workflow::{InputSlot, OutputSlot, PortDefinition, SlotMode, StepDefinition};

    fn step(id: &str, reads: &[&str], writes: &[&str]) -> StepDefinition {
        let yaml = format!("id: {id}");
        let mut step: StepDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        step.inputs = reads
            .iter()
            .enumerate()
            .map(|(i, p)| InputSlot {
                name: format!("in{i}"),
                port: p.to_string(),
                optional: false,
                propagate_skip: true,
                mode: SlotMode::Stream,
            })
            .collect();
        step.outputs = writes
            .iter()
            .enumerate()
            .map(|(i, p)| OutputSlot {
                name: format!("out{i}"),
                port: p.to_string(),
            })
            .collect();
        step
    }

    fn workflow(steps: Vec<StepDefinition>, ports: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            name: "wf".into(),
            description: None,
            ports: ports
                .iter()
                .map(|p| PortDefinition {
                    id: p.to_string(),
                    type_tag: "any".into(),
                })
                .collect(),
            steps,
            inputs: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn diamond_orders_producers_first() {
        let def = workflow(
            vec![
                step("d", &["bd", "cd"], &[]),
                step("b", &["ab"], &["bd"]),
                step("a", &[], &["ab"]),
                step("c", &["ab"], &["cd"]),
            ],
            &["ab", "bd", "cd"],
        );
        let order = topological_order(&def).unwrap();
        let pos = |id: &str| order.iter().position(|s| s == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn detects_two_step_cycle() {
        let def = workflow(
            vec![step("a", &["q"], &["p"]), step("b", &["p"], &["q"])],
            &["p", "q"],
        );
        let err = validate_dag(&def).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cycle"), "got: {msg}");
    }

    #[test]
    fn detects_self_loop() {
        let def = workflow(vec![step("a", &["p"], &["p"])], &["p"]);
        assert!(matches!(validate_dag(&def), Err(WorkflowError::CycleDetected(_))));
    }

    #[test]
    fn independent_steps_are_acyclic() {
        let def = workflow(vec![step("a", &[], &["p"]), step("b", &[], &["q"])], &["p", "q"]);
        assert_eq!(topological_order(&def).unwrap().len(), 2);
    }
}
