//! Per-step and graph wiring state owned by the driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use hyflow_types::checkpoint::InvocationRecord;
use hyflow_types::execution::StepStatus;
use hyflow_types::token::{Provenance, Token};
use hyflow_types::workflow::{StepDefinition, WorkflowDefinition};

use crate::executor::StepExecutionError;
use crate::graph::{InputCombinator, ReorderBuffer};

/// Pending graph mutations, processed in FIFO order.
#[derive(Debug)]
pub(crate) enum Work {
    /// Offer a token, already appended to its port, to the port's consumers.
    Deliver { port: String, token: Token },
    /// Close a port and tell its consumers.
    Close { port: String, reason: hyflow_types::token::TerminationReason },
}

/// Which step slots read from each port.
#[derive(Debug, Default)]
pub(crate) struct Wiring {
    pub consumers: HashMap<String, Vec<(String, usize)>>,
}

impl Wiring {
    pub fn new(definition: &WorkflowDefinition) -> Self {
        let mut consumers: HashMap<String, Vec<(String, usize)>> = HashMap::new();
        for step in &definition.steps {
            for (idx, slot) in step.inputs.iter().enumerate() {
                consumers
                    .entry(slot.port.clone())
                    .or_default()
                    .push((step.id.clone(), idx));
            }
        }
        Self { consumers }
    }

    pub fn consumers_of(&self, port: &str) -> &[(String, usize)] {
        self.consumers.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of distinct consumer steps of a port.
    pub fn consumer_steps(&self, port: &str) -> usize {
        let mut steps: Vec<&str> = self.consumers_of(port).iter().map(|(s, _)| s.as_str()).collect();
        steps.sort_unstable();
        steps.dedup();
        steps.len()
    }
}

/// An invocation whose task is still running.
#[derive(Debug)]
pub(crate) struct LiveInvocation {
    pub status: StepStatus,
    /// The record as fired, used if the task dies without an outcome.
    pub fired: InvocationRecord,
}

pub(crate) struct StepState {
    pub def: Arc<StepDefinition>,
    pub combinator: InputCombinator,
    pub next_ordinal: u64,
    pub join: ReorderBuffer<Vec<Token>>,
    pub live: BTreeMap<u64, LiveInvocation>,
    /// Finished invocations waiting for earlier ordinals to release.
    pub unreleased: BTreeMap<u64, InvocationRecord>,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Status imposed by a blocked input or a run-wide cancellation.
    pub forced: Option<(StepStatus, String)>,
    pub finished: Option<StepStatus>,
    /// Last aggregate status published.
    pub status: StepStatus,
    pub error: Option<String>,
}

impl StepState {
    pub fn new(def: StepDefinition) -> Self {
        let combinator = InputCombinator::new(&def);
        Self {
            def: Arc::new(def),
            combinator,
            next_ordinal: 0,
            join: ReorderBuffer::new(),
            live: BTreeMap::new(),
            unreleased: BTreeMap::new(),
            completed: 0,
            failed: 0,
            cancelled: 0,
            forced: None,
            finished: None,
            status: StepStatus::Waiting,
            error: None,
        }
    }

    /// Nothing running and nothing waiting in the join.
    pub fn idle(&self) -> bool {
        self.live.is_empty() && self.unreleased.is_empty()
    }

    pub fn accepts_fires(&self) -> bool {
        self.finished.is_none() && self.forced.is_none()
    }

    pub fn count(&mut self, record: &InvocationRecord) {
        match record.status {
            StepStatus::Completed => self.completed += 1,
            StepStatus::Failed => self.failed += 1,
            StepStatus::Cancelled => self.cancelled += 1,
            _ => {}
        }
        if record.status == StepStatus::Failed && self.error.is_none() {
            self.error = record.error.clone();
        }
    }

    /// Impose a status unless one is already imposed.
    pub fn force(&mut self, status: StepStatus, reason: impl Into<String>) {
        if self.finished.is_none() && self.forced.is_none() {
            self.forced = Some((status, reason.into()));
        }
    }

    /// Terminal status once the step is idle and can fire nothing more.
    pub fn terminal_status(&self) -> StepStatus {
        if self.failed > 0 {
            return StepStatus::Failed;
        }
        match &self.forced {
            Some((StepStatus::Cancelled, _))
                if self.combinator.exhausted() && self.cancelled == 0 && self.next_ordinal > 0 =>
            {
                StepStatus::Completed
            }
            Some((status, _)) => *status,
            None if self.cancelled > 0 => StepStatus::Cancelled,
            None => StepStatus::Completed,
        }
    }

    /// Most advanced status among running invocations.
    pub fn aggregate_status(&self) -> Option<StepStatus> {
        self.live.values().map(|l| l.status).max_by_key(|s| s.rank())
    }

    /// Wrap produced artifacts as output tokens, one per output slot.
    pub fn output_tokens(
        &self,
        record: &InvocationRecord,
        artifacts: &[hyflow_types::execution::ProducedArtifact],
    ) -> Result<Vec<Token>, StepExecutionError> {
        let mut provenance: Vec<Provenance> = Vec::new();
        for slot in &self.def.inputs {
            if let Some(token) = record.inputs.get(&slot.name) {
                for entry in &token.provenance {
                    if !provenance.contains(entry) {
                        provenance.push(entry.clone());
                    }
                }
            }
        }
        provenance.push(Provenance {
            step: self.def.id.clone(),
            tag: record.tag.clone(),
        });

        self.def
            .outputs
            .iter()
            .map(|out| {
                let artifact = artifacts
                    .iter()
                    .find(|a| a.slot == out.name)
                    .ok_or_else(|| StepExecutionError::MissingOutput(out.name.clone()))?;
                let mut token = Token::new(out.port.clone(), record.tag.clone(), artifact.payload.clone());
                token.provenance = provenance.clone();
                Ok(token)
            })
            .collect()
    }
}
