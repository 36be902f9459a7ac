//! The single task that owns all port and step state of a run.
//!
//! Invocation tasks report back through a `JoinSet` (terminal outcomes) and
//! an mpsc channel (status progress). Every graph mutation goes through the
//! work queue and is processed to completion before the driver waits again,
//! so a delivery and the runnability checks it triggers are one unit.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use hyflow_types::checkpoint::{InvocationRecord, StepRecord};
use hyflow_types::event::EngineEvent;
use hyflow_types::execution::{InvocationKey, RunStatus, StepStatus};
use hyflow_types::report::StepOutcome;
use hyflow_types::token::{Tag, TerminationReason, Token};
use hyflow_types::workflow::{StepDefinition, WorkflowDefinition};
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointManager, CheckpointStore, Snapshot};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::executor::{Invocation, InvocationError, InvocationOutcome, Progress, StepExecutionError, StepExecutor};
use crate::graph::dag::topological_order;
use crate::graph::{Fire, PortState, ReorderBuffer};
use crate::transfer::TransferManager;

use super::state::{LiveInvocation, StepState, Wiring, Work};

/// What the driver hands back once every step is terminal.
pub(crate) struct DriverOutcome {
    pub status: RunStatus,
    pub steps: Vec<StepOutcome>,
    pub outputs: BTreeMap<String, Vec<Token>>,
}

enum Wake {
    Cancelled,
    Progress(Progress),
    Joined(Option<Result<(task::Id, InvocationOutcome), JoinError>>),
}

pub(crate) struct Driver<S: CheckpointStore> {
    definition: Arc<WorkflowDefinition>,
    order: Vec<String>,
    wiring: Wiring,
    ports: HashMap<String, PortState>,
    steps: HashMap<String, StepState>,
    checkpoint: Arc<CheckpointManager<S>>,
    executor: Arc<StepExecutor<S>>,
    transfers: Arc<TransferManager>,
    events: EventBus,
    cancel: CancellationToken,
    progress: mpsc::UnboundedReceiver<Progress>,
    tasks: JoinSet<InvocationOutcome>,
    task_keys: HashMap<task::Id, InvocationKey>,
    queue: VecDeque<Work>,
    cancel_seen: bool,
    cancel_requested: bool,
    aborted: bool,
}

impl<S: CheckpointStore> Driver<S> {
    pub fn new(
        definition: Arc<WorkflowDefinition>,
        checkpoint: Arc<CheckpointManager<S>>,
        executor: Arc<StepExecutor<S>>,
        transfers: Arc<TransferManager>,
        events: EventBus,
        cancel: CancellationToken,
        progress: mpsc::UnboundedReceiver<Progress>,
    ) -> Result<Self, EngineError> {
        let order = topological_order(&definition)?;
        let wiring = Wiring::new(&definition);
        let ports = definition
            .ports
            .iter()
            .map(|p| {
                let retain = definition.outputs.contains(&p.id);
                (p.id.clone(), PortState::new(p.id.clone(), wiring.consumer_steps(&p.id), retain))
            })
            .collect();
        let steps = definition
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepState::new(s.clone())))
            .collect();

        Ok(Self {
            definition,
            order,
            wiring,
            ports,
            steps,
            checkpoint,
            executor,
            transfers,
            events,
            cancel,
            progress,
            tasks: JoinSet::new(),
            task_keys: HashMap::new(),
            queue: VecDeque::new(),
            cancel_seen: false,
            cancel_requested: false,
            aborted: false,
        })
    }

    /// Run to completion. On a fatal error every in-flight invocation is
    /// cancelled and drained before the error is returned.
    pub async fn run(mut self, snapshot: Option<Snapshot>) -> Result<DriverOutcome, EngineError> {
        match self.drive(snapshot).await {
            Ok(()) => Ok(self.outcome()),
            Err(e) => {
                tracing::error!(error = %e, "stopping run, cancelling in-flight work");
                self.cancel.cancel();
                while self.tasks.join_next().await.is_some() {}
                Err(e)
            }
        }
    }

    async fn drive(&mut self, snapshot: Option<Snapshot>) -> Result<(), EngineError> {
        if let Some(snapshot) = snapshot {
            self.restore(snapshot).await?;
        }
        self.seed_inputs().await?;
        for step in self.order.clone() {
            let fire = self.step_mut(&step)?.combinator.source_fire();
            if let Some(fire) = fire {
                self.fire(&step, fire).await?;
            }
        }

        loop {
            self.settle().await?;
            if self.tasks.is_empty() {
                break;
            }

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.cancel_seen => Wake::Cancelled,
                Some(progress) = self.progress.recv() => Wake::Progress(progress),
                joined = self.tasks.join_next_with_id() => Wake::Joined(joined),
            };
            match wake {
                Wake::Cancelled => self.on_cancel(),
                Wake::Progress(progress) => self.on_progress(progress),
                Wake::Joined(Some(Ok((id, outcome)))) => {
                    self.task_keys.remove(&id);
                    self.finish(outcome).await?;
                }
                Wake::Joined(Some(Err(err))) => self.on_task_error(err).await?,
                Wake::Joined(None) => break,
            }
        }

        let unfinished: Vec<&str> = self
            .order
            .iter()
            .filter(|s| self.steps.get(*s).is_some_and(|st| st.finished.is_none()))
            .map(String::as_str)
            .collect();
        if !unfinished.is_empty() {
            return Err(EngineError::Internal(format!(
                "run stalled with unfinished steps: {}",
                unfinished.join(", ")
            )));
        }
        Ok(())
    }

    fn step_mut(&mut self, step: &str) -> Result<&mut StepState, EngineError> {
        self.steps
            .get_mut(step)
            .ok_or_else(|| EngineError::Internal(format!("unknown step '{step}'")))
    }

    // -----------------------------------------------------------------------
    // Startup
    // -----------------------------------------------------------------------

    /// Place the workflow's initial tokens and close their ports. Ports that
    /// already received their token before a restart are only closed.
    async fn seed_inputs(&mut self) -> Result<(), EngineError> {
        let inputs = self.definition.inputs.clone();
        for input in inputs {
            let Some(port) = self.ports.get_mut(&input.port) else {
                return Err(EngineError::Internal(format!("unknown input port '{}'", input.port)));
            };
            if port.next_seq() == 0 && port.closed().is_none() {
                let token = Token::new(input.port.clone(), Tag::root(), input.payload());
                self.checkpoint.record_token(&token).await?;
                port.append(token.clone());
                self.transfers.register(&token, true);
                self.queue.push_back(Work::Deliver {
                    port: input.port.clone(),
                    token,
                });
            }
            self.queue.push_back(Work::Close {
                port: input.port,
                reason: TerminationReason::Completed,
            });
        }
        Ok(())
    }

    /// Rebuild port logs and step state from a snapshot, re-dispatch
    /// unfinished invocations and re-release finished ones.
    async fn restore(&mut self, snapshot: Snapshot) -> Result<(), EngineError> {
        tracing::info!(
            run_id = %snapshot.run_id,
            invocations = snapshot.invocations.len(),
            finished_steps = snapshot.steps.len(),
            "restoring run state"
        );

        for (port_id, tokens) in &snapshot.tokens {
            let Some(port) = self.ports.get_mut(port_id) else {
                tracing::warn!(port = %port_id, "checkpoint references a port missing from the workflow");
                continue;
            };
            for token in tokens {
                port.append(token.clone());
                self.transfers.register(token, false);
            }
        }

        let mut finished_steps = Vec::new();
        let mut redispatch = Vec::new();
        let mut pending = Vec::new();
        for step in self.order.clone() {
            let st = self.step_mut(&step)?;
            let records: Vec<&InvocationRecord> = snapshot.invocations_of(&step).collect();
            for record in &records {
                st.combinator.mark_fired(&record.tag, &record.inputs);
                st.next_ordinal = st.next_ordinal.max(record.key.ordinal + 1);
                if record.status.is_terminal() {
                    st.count(record);
                }
            }
            let released = records
                .iter()
                .enumerate()
                .take_while(|(i, r)| r.released && r.key.ordinal == *i as u64)
                .count() as u64;
            st.join = ReorderBuffer::starting_at(released);

            if let Some(record) = snapshot.steps.get(&step) {
                st.finished = Some(record.status);
                st.status = record.status;
                finished_steps.push((step.clone(), record.status));
                continue;
            }
            for record in records.into_iter().filter(|r| r.key.ordinal >= released) {
                if record.status.is_terminal() {
                    pending.push(record.clone());
                } else {
                    st.live.insert(
                        record.key.ordinal,
                        LiveInvocation {
                            status: record.status,
                            fired: record.clone(),
                        },
                    );
                    redispatch.push((st.def.clone(), record.clone()));
                }
            }
        }

        for (port, tokens) in &snapshot.tokens {
            for token in tokens {
                self.queue.push_back(Work::Deliver {
                    port: port.clone(),
                    token: token.clone(),
                });
            }
        }
        for (step, status) in &finished_steps {
            self.release_step_resources(step, *status)?;
        }

        // Restored reservations must be held before any new invocation can bind.
        for (_, record) in &redispatch {
            if let Some(binding) = &record.binding {
                self.executor.restore_binding(binding.clone());
            }
        }
        for (def, record) in redispatch {
            tracing::info!(invocation = %record.key, status = %record.status, "re-dispatching invocation");
            self.spawn(def, record);
        }
        for record in pending {
            self.join(record).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Work queue
    // -----------------------------------------------------------------------

    /// Process queued work and step checks until nothing changes.
    async fn settle(&mut self) -> Result<(), EngineError> {
        loop {
            while let Some(work) = self.queue.pop_front() {
                self.process(work).await?;
            }
            let mut progressed = false;
            for step in self.order.clone() {
                progressed |= self.check_step(&step).await?;
            }
            if !progressed && self.queue.is_empty() {
                return Ok(());
            }
        }
    }

    async fn process(&mut self, work: Work) -> Result<(), EngineError> {
        match work {
            Work::Deliver { port, token } => {
                let consumers = self.wiring.consumers_of(&port).to_vec();
                for (step, slot) in consumers {
                    let st = self.step_mut(&step)?;
                    if !st.accepts_fires() {
                        continue;
                    }
                    let fires = st.combinator.offer(slot, &token);
                    for fire in fires {
                        self.fire(&step, fire).await?;
                    }
                }
            }
            Work::Close { port, reason } => {
                let Some(state) = self.ports.get_mut(&port) else {
                    return Err(EngineError::Internal(format!("unknown port '{port}'")));
                };
                if !state.close(reason) {
                    return Ok(());
                }
                tracing::debug!(port = %port, reason = %reason, "port closed");
                let consumers = self.wiring.consumers_of(&port).to_vec();
                for (step, slot) in consumers {
                    let st = self.step_mut(&step)?;
                    if st.finished.is_some() {
                        continue;
                    }
                    let fires = st.combinator.close(slot, reason);
                    for fire in fires {
                        self.fire(&step, fire).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Invocations
    // -----------------------------------------------------------------------

    async fn fire(&mut self, step: &str, fire: Fire) -> Result<(), EngineError> {
        let st = self.steps.get_mut(step).ok_or_else(|| EngineError::Internal(format!("unknown step '{step}'")))?;
        if !st.accepts_fires() {
            return Ok(());
        }
        let key = InvocationKey::new(step, st.next_ordinal);
        st.next_ordinal += 1;

        let record = InvocationRecord::fired(key.clone(), fire.tag, fire.inputs);
        self.checkpoint.record_invocation(&record).await?;

        tracing::debug!(invocation = %key, tag = %record.tag, "invocation fired");
        self.events.publish(EngineEvent::InvocationFired {
            step: step.to_string(),
            ordinal: key.ordinal,
            tag: record.tag.clone(),
        });
        st.live.insert(
            key.ordinal,
            LiveInvocation {
                status: StepStatus::Runnable,
                fired: record.clone(),
            },
        );
        let def = st.def.clone();
        self.spawn(def, record);
        self.refresh_status(step);
        Ok(())
    }

    fn spawn(&mut self, step: Arc<StepDefinition>, record: InvocationRecord) {
        let executor = self.executor.clone();
        let key = record.key.clone();
        let invocation = Invocation {
            record,
            step,
            cancel: self.cancel.child_token(),
        };
        let handle = self.tasks.spawn(async move { executor.execute(invocation).await });
        self.task_keys.insert(handle.id(), key);
    }

    fn on_progress(&mut self, progress: Progress) {
        if let Some(st) = self.steps.get_mut(&progress.key.step) {
            if let Some(live) = st.live.get_mut(&progress.key.ordinal) {
                live.status = progress.status;
            }
        }
        self.refresh_status(&progress.key.step);
    }

    fn refresh_status(&mut self, step: &str) {
        let Some(st) = self.steps.get_mut(step) else {
            return;
        };
        if st.finished.is_some() {
            return;
        }
        if let Some(status) = st.aggregate_status() {
            if status != st.status {
                st.status = status;
                self.events.publish(EngineEvent::StepStatusChanged {
                    step: step.to_string(),
                    status,
                });
            }
        }
    }

    async fn on_task_error(&mut self, err: JoinError) -> Result<(), EngineError> {
        let Some(key) = self.task_keys.remove(&err.id()) else {
            return Err(EngineError::Internal(format!("unknown invocation task ended: {err}")));
        };
        let record = self
            .step_mut(&key.step)?
            .live
            .get(&key.ordinal)
            .map(|l| l.fired.clone())
            .ok_or_else(|| EngineError::Internal(format!("no live record for {key}")))?;
        tracing::error!(invocation = %key, error = %err, "invocation task ended abnormally");
        let result = if err.is_cancelled() {
            Err(InvocationError::Cancelled("invocation task aborted".into()))
        } else {
            Err(StepExecutionError::TaskAborted(err.to_string()).into())
        };
        self.finish(InvocationOutcome { record, result }).await
    }

    /// Record an invocation's terminal status and pass it to the step join.
    async fn finish(&mut self, outcome: InvocationOutcome) -> Result<(), EngineError> {
        let InvocationOutcome { mut record, result } = outcome;
        let key = record.key.clone();
        let st = self.step_mut(&key.step)?;
        st.live.remove(&key.ordinal);

        let (status, outputs, error) = match result {
            Ok(artifacts) => match st.output_tokens(&record, &artifacts) {
                Ok(tokens) => (StepStatus::Completed, tokens, None),
                Err(e) => (StepStatus::Failed, Vec::new(), Some(e.to_string())),
            },
            Err(InvocationError::Persistence(e)) => return Err(e.into()),
            Err(e) if e.is_cancelled() => (StepStatus::Cancelled, Vec::new(), Some(e.to_string())),
            Err(e) => (StepStatus::Failed, Vec::new(), Some(e.to_string())),
        };
        record.status = status;
        record.outputs = outputs;
        record.error = error;
        self.checkpoint.record_invocation(&record).await?;

        match &record.error {
            Some(error) if status == StepStatus::Failed => {
                tracing::warn!(invocation = %key, error = %error, "invocation failed");
            }
            _ => tracing::info!(invocation = %key, status = %status, "invocation finished"),
        }
        self.events.publish(EngineEvent::InvocationFinished {
            step: key.step.clone(),
            ordinal: key.ordinal,
            status,
            error: record.error.clone(),
        });

        self.step_mut(&key.step)?.count(&record);
        self.refresh_status(&key.step);
        self.join(record).await
    }

    /// Insert a finished invocation into its step's join and release every
    /// invocation that is now next in fire order.
    async fn join(&mut self, record: InvocationRecord) -> Result<(), EngineError> {
        let step = record.key.step.clone();
        let ordinal = record.key.ordinal;
        let value = (record.status == StepStatus::Completed).then(|| record.outputs.clone());

        let released = {
            let st = self.step_mut(&step)?;
            st.unreleased.insert(ordinal, record);
            st.join.insert(ordinal, value)
        };

        for (ordinal, tokens) in released {
            for token in tokens.unwrap_or_default() {
                self.release_token(token).await?;
            }
            let record = self.step_mut(&step)?.unreleased.remove(&ordinal);
            if let Some(mut record) = record {
                record.released = true;
                self.checkpoint.record_invocation(&record).await?;
            }
        }
        Ok(())
    }

    /// Append a produced token to its port and queue its delivery.
    async fn release_token(&mut self, mut token: Token) -> Result<(), EngineError> {
        let Some(port) = self.ports.get_mut(&token.port) else {
            return Err(EngineError::Internal(format!("unknown output port '{}'", token.port)));
        };
        if port.contains(&token.id) {
            return Ok(());
        }
        token.seq = port.next_seq();
        self.checkpoint.record_token(&token).await?;
        if !port.append(token.clone()) {
            tracing::warn!(port = %token.port, token_id = %token.id, "token released to a closed port");
            return Ok(());
        }
        self.transfers.register(&token, true);
        tracing::debug!(port = %token.port, seq = token.seq, tag = %token.tag, "token released");
        self.queue.push_back(Work::Deliver {
            port: token.port.clone(),
            token,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step termination
    // -----------------------------------------------------------------------

    /// Finalize a step if it can no longer fire and has nothing in flight.
    /// Returns whether the step was finalized.
    async fn check_step(&mut self, step: &str) -> Result<bool, EngineError> {
        let mut abort_cause = None;
        let decision = {
            let st = self.step_mut(step)?;
            if st.finished.is_some() {
                return Ok(false);
            }
            if st.forced.is_none() {
                if let Some(blocked) = st.combinator.blocked() {
                    let slot = &blocked.slot;
                    let (status, reason) = match blocked.reason {
                        TerminationReason::Completed => {
                            (StepStatus::Completed, format!("input '{slot}' closed without tokens"))
                        }
                        TerminationReason::Cancelled => {
                            (StepStatus::Cancelled, format!("input '{slot}' was cancelled upstream"))
                        }
                        reason if blocked.propagate_skip => {
                            (StepStatus::Skipped, format!("input '{slot}' was {reason} upstream"))
                        }
                        reason => {
                            let cause = format!("input '{slot}' was {reason} upstream and step '{step}' cannot skip");
                            abort_cause = Some(cause.clone());
                            (StepStatus::Failed, cause)
                        }
                    };
                    st.force(status, reason);
                }
            }
            let done = st.idle() && (st.forced.is_some() || st.combinator.exhausted());
            done.then(|| {
                let reason = match &st.forced {
                    Some((_, reason)) => Some(reason.clone()),
                    None => st.error.clone(),
                };
                (st.terminal_status(), reason)
            })
        };

        if let Some(cause) = abort_cause {
            self.abort(&cause);
        }
        match decision {
            Some((status, reason)) => {
                self.finalize(step, status, reason).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finalize(&mut self, step: &str, status: StepStatus, reason: Option<String>) -> Result<(), EngineError> {
        let reason = reason.filter(|_| status != StepStatus::Completed);
        self.checkpoint
            .record_step(step, &StepRecord { status, reason: reason.clone() })
            .await?;

        let st = self.step_mut(step)?;
        st.finished = Some(status);
        st.status = status;
        if st.error.is_none() {
            st.error = reason.clone();
        }

        match status {
            StepStatus::Failed => tracing::warn!(step, reason = reason.as_deref().unwrap_or(""), "step failed"),
            _ => tracing::info!(step, status = %status, "step finished"),
        }
        self.events.publish(EngineEvent::StepStatusChanged {
            step: step.to_string(),
            status,
        });
        self.release_step_resources(step, status)
    }

    /// Close the step's output ports and drop its claim on its input ports.
    fn release_step_resources(&mut self, step: &str, status: StepStatus) -> Result<(), EngineError> {
        let def = self.step_mut(step)?.def.clone();
        for out in &def.outputs {
            self.queue.push_back(Work::Close {
                port: out.port.clone(),
                reason: status.termination_reason(),
            });
        }
        let mut inputs: Vec<&str> = def.inputs.iter().map(|s| s.port.as_str()).collect();
        inputs.sort_unstable();
        inputs.dedup();
        for port in inputs {
            if let Some(state) = self.ports.get_mut(port) {
                for token in state.consumer_finished() {
                    self.transfers.forget(&token);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    fn on_cancel(&mut self) {
        self.cancel_seen = true;
        if !self.aborted {
            self.cancel_requested = true;
            tracing::info!("run cancellation requested");
        }
        for st in self.steps.values_mut() {
            st.force(StepStatus::Cancelled, "run cancelled");
        }
    }

    /// Stop the whole workflow after a failure no consumer can absorb.
    fn abort(&mut self, cause: &str) {
        if self.aborted {
            return;
        }
        self.aborted = true;
        tracing::warn!(cause, "aborting workflow");
        for st in self.steps.values_mut() {
            st.force(StepStatus::Cancelled, format!("workflow aborted: {cause}"));
        }
        self.cancel.cancel();
    }

    // -----------------------------------------------------------------------
    // Result
    // -----------------------------------------------------------------------

    fn outcome(&self) -> DriverOutcome {
        let steps: Vec<StepOutcome> = self
            .definition
            .steps
            .iter()
            .filter_map(|def| self.steps.get(&def.id))
            .map(|st| StepOutcome {
                step: st.def.id.clone(),
                status: st.finished.unwrap_or(st.status),
                invocations: st.next_ordinal,
                failed_invocations: st.failed,
                error: st.error.clone(),
            })
            .collect();

        let status = if self.cancel_requested {
            RunStatus::Cancelled
        } else if steps.iter().any(|s| s.status == StepStatus::Failed) {
            RunStatus::Failed
        } else if steps.iter().any(|s| s.status == StepStatus::Cancelled) {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };

        let outputs = self
            .definition
            .outputs
            .iter()
            .map(|port| {
                let tokens = self.ports.get(port).map(|p| p.tokens().to_vec()).unwrap_or_default();
                (port.clone(), tokens)
            })
            .collect();

        DriverOutcome { status, steps, outputs }
    }
}
