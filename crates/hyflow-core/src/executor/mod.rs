//! Step Executor: runs one fired invocation to a terminal state.
//!
//! Each invocation is driven by its own task:
//!
//! 1. obtain a binding (restored or scheduled) and persist it
//! 2. stage data inputs at every bound location
//! 3. submit the job and persist its handle
//! 4. poll until the job finishes, is cancelled, or times out
//!
//! The invocation record is owned by the task while it runs and handed back
//! to the engine in the [`InvocationOutcome`]. The engine alone turns
//! produced artifacts into tokens.

pub mod retry;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use hyflow_types::config::ExecutorConfig;
use hyflow_types::deployment::LocationRef;
use hyflow_types::event::EngineEvent;
use hyflow_types::execution::{
    Binding, InvocationKey, JobHandle, JobSpec, JobState, ProducedArtifact, StepStatus,
};
use hyflow_types::checkpoint::InvocationRecord;
use hyflow_types::token::{Payload, Token};
use hyflow_types::workflow::StepDefinition;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::checkpoint::{CheckpointManager, CheckpointStore, PersistenceError};
use crate::connector::{BoxConnector, ConnectorError, ConnectorRegistry};
use crate::event::EventBus;
use crate::scheduler::{BindingGuard, ScheduleRequest, Scheduler, SchedulingError};
use crate::transfer::{DataTransferError, TransferManager};

pub use retry::RetryHandler;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StepExecutionError {
    #[error("job failed (exit code {exit_code:?}): {message}")]
    JobFailed { exit_code: Option<i32>, message: String },

    #[error("connector error: {0}")]
    Connector(#[from] ConnectorError),

    #[error("no connector registered for deployment '{0}'")]
    UnknownDeployment(String),

    #[error("invocation {0} has no bound location")]
    Unbound(InvocationKey),

    #[error("job did not produce output '{0}'")]
    MissingOutput(String),

    #[error("invocation task ended abnormally: {0}")]
    TaskAborted(String),
}

/// Why an invocation did not complete.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Transfer(#[from] DataTransferError),

    #[error(transparent)]
    Execution(#[from] StepExecutionError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("{0}")]
    Cancelled(String),
}

impl InvocationError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, InvocationError::Cancelled(_))
    }
}

// ---------------------------------------------------------------------------
// Invocation hand-off
// ---------------------------------------------------------------------------

/// A fired invocation handed to the executor.
pub struct Invocation {
    pub record: InvocationRecord,
    pub step: Arc<StepDefinition>,
    pub cancel: CancellationToken,
}

/// Returned to the engine when the invocation task ends.
#[derive(Debug)]
pub struct InvocationOutcome {
    pub record: InvocationRecord,
    pub result: Result<Vec<ProducedArtifact>, InvocationError>,
}

/// Non-terminal status change of a running invocation.
#[derive(Debug, Clone)]
pub struct Progress {
    pub key: InvocationKey,
    pub status: StepStatus,
}

// ---------------------------------------------------------------------------
// StepExecutor
// ---------------------------------------------------------------------------

pub struct StepExecutor<S: CheckpointStore> {
    scheduler: Arc<Scheduler>,
    transfers: Arc<TransferManager>,
    registry: Arc<ConnectorRegistry>,
    checkpoint: Arc<CheckpointManager<S>>,
    events: EventBus,
    config: ExecutorConfig,
    progress: mpsc::UnboundedSender<Progress>,
}

impl<S: CheckpointStore> StepExecutor<S> {
    pub fn new(
        scheduler: Arc<Scheduler>,
        transfers: Arc<TransferManager>,
        registry: Arc<ConnectorRegistry>,
        checkpoint: Arc<CheckpointManager<S>>,
        events: EventBus,
        config: ExecutorConfig,
        progress: mpsc::UnboundedSender<Progress>,
    ) -> Self {
        Self {
            scheduler,
            transfers,
            registry,
            checkpoint,
            events,
            config,
            progress,
        }
    }

    /// Drive an invocation until it finishes. Never panics on failure; the
    /// error is carried in the outcome.
    pub async fn execute(&self, mut invocation: Invocation) -> InvocationOutcome {
        let result = self.drive(&mut invocation).await;
        InvocationOutcome {
            record: invocation.record,
            result,
        }
    }

    /// Re-install a checkpointed binding ahead of re-dispatching its
    /// invocation.
    pub fn restore_binding(&self, binding: Binding) {
        self.scheduler.restore(binding);
    }

    fn report(&self, key: &InvocationKey, status: StepStatus) {
        let _ = self.progress.send(Progress {
            key: key.clone(),
            status,
        });
    }

    async fn drive(&self, inv: &mut Invocation) -> Result<Vec<ProducedArtifact>, InvocationError> {
        let key = inv.record.key.clone();
        self.report(&key, StepStatus::Scheduling);

        let binding = self.bind(inv).await?;
        let _guard = BindingGuard::new(self.scheduler.clone(), key.clone());
        if inv.record.binding.is_none() {
            inv.record.binding = Some(binding.clone());
            inv.record.status = StepStatus::Scheduling;
            self.checkpoint.record_invocation(&inv.record).await?;
            self.events.publish(EngineEvent::InvocationBound {
                step: key.step.clone(),
                ordinal: key.ordinal,
                locations: binding.locations.clone(),
            });
        }

        let primary = binding
            .primary()
            .cloned()
            .ok_or_else(|| StepExecutionError::Unbound(key.clone()))?;
        let inputs = self.stage_inputs(inv, &binding, &primary).await?;

        let connector = self
            .registry
            .get(&primary.deployment)
            .ok_or_else(|| StepExecutionError::UnknownDeployment(primary.deployment.clone()))?;
        let deadline = RetryHandler::timeout(&inv.step, &self.config).map(|t| Instant::now() + t);

        let mut resumed = inv.record.job.take();
        loop {
            let recovering = resumed.is_some();
            let handle = match resumed.take() {
                Some(handle) => {
                    tracing::info!(invocation = %key, job_id = %handle.job_id, "re-attaching to job");
                    inv.record.job = Some(handle.clone());
                    self.report(&key, StepStatus::Running);
                    handle
                }
                None => self.submit(inv, connector, &binding, &inputs).await?,
            };

            match self.monitor(connector, &handle, deadline, &inv.cancel).await? {
                JobState::Completed { outputs } => return Ok(outputs),
                JobState::Unknown if recovering => {
                    tracing::warn!(invocation = %key, job_id = %handle.job_id, "job lost across restart, resubmitting");
                }
                JobState::Failed { exit_code, message } => {
                    if !RetryHandler::should_retry(&inv.step.retry, inv.record.attempt) {
                        return Err(StepExecutionError::JobFailed { exit_code, message }.into());
                    }
                    tracing::warn!(
                        invocation = %key,
                        attempt = inv.record.attempt,
                        max_attempts = inv.step.retry.max_attempts,
                        error = %message,
                        "job failed, resubmitting"
                    );
                }
                JobState::Unknown => {
                    let message = format!("connector lost track of job {}", handle.job_id);
                    if !RetryHandler::should_retry(&inv.step.retry, inv.record.attempt) {
                        return Err(StepExecutionError::JobFailed { exit_code: None, message }.into());
                    }
                    tracing::warn!(invocation = %key, attempt = inv.record.attempt, "{message}, resubmitting");
                }
                JobState::Cancelled => {
                    return Err(InvocationError::Cancelled(format!("job {} was cancelled", handle.job_id)));
                }
                JobState::Pending | JobState::Running => {
                    return Err(StepExecutionError::Connector(ConnectorError::Deployment(
                        "poll returned before the job finished".into(),
                    ))
                    .into());
                }
            }
        }
    }

    async fn bind(&self, inv: &Invocation) -> Result<Binding, InvocationError> {
        if let Some(binding) = &inv.record.binding {
            self.scheduler.restore(binding.clone());
            return Ok(binding.clone());
        }
        let inputs: Vec<&Token> = inv.record.inputs.values().collect();
        let transfers = &self.transfers;
        let locality = |location: &LocationRef| transfers.resident_bytes(inputs.iter().copied(), location);
        let request = ScheduleRequest {
            key: &inv.record.key,
            requirements: &inv.step.requirements,
            policy: &inv.step.binding,
        };
        match self.scheduler.schedule(request, &locality, &inv.cancel).await {
            Ok(binding) => Ok(binding),
            Err(SchedulingError::Cancelled(key)) => {
                Err(InvocationError::Cancelled(format!("{key} cancelled while waiting for resources")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Make data inputs available at every bound location. Returned payloads
    /// reference the primary location.
    async fn stage_inputs(
        &self,
        inv: &Invocation,
        binding: &Binding,
        primary: &LocationRef,
    ) -> Result<BTreeMap<String, Payload>, InvocationError> {
        let mut staged = BTreeMap::new();
        for (slot, token) in &inv.record.inputs {
            if !token.payload.has_data() {
                staged.insert(slot.clone(), token.payload.clone());
                continue;
            }
            for location in binding.locations.iter().skip(1) {
                self.stage(token, location, &inv.cancel).await?;
            }
            let payload = self.stage(token, primary, &inv.cancel).await?;
            staged.insert(slot.clone(), payload);
        }
        Ok(staged)
    }

    async fn stage(
        &self,
        token: &Token,
        location: &LocationRef,
        cancel: &CancellationToken,
    ) -> Result<Payload, InvocationError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(InvocationError::Cancelled("cancelled while staging inputs".into())),
            staged = self.transfers.ensure_token(token, location) => Ok(staged?),
        }
    }

    async fn submit(
        &self,
        inv: &mut Invocation,
        connector: &BoxConnector,
        binding: &Binding,
        inputs: &BTreeMap<String, Payload>,
    ) -> Result<JobHandle, InvocationError> {
        inv.record.attempt += 1;
        let spec = JobSpec {
            run_id: self.checkpoint.run_id(),
            key: inv.record.key.clone(),
            tag: inv.record.tag.clone(),
            attempt: inv.record.attempt,
            command: inv.step.command.clone(),
            inputs: inputs.clone(),
            outputs: inv.step.outputs.iter().map(|o| o.name.clone()).collect(),
            locations: binding.locations.clone(),
            grant: binding.grant.clone(),
        };
        let handle = connector.submit(&spec).await.map_err(StepExecutionError::from)?;

        inv.record.job = Some(handle.clone());
        inv.record.status = StepStatus::Running;
        if let Err(e) = self.checkpoint.record_invocation(&inv.record).await {
            // An unrecorded job would be submitted again on resume.
            tracing::warn!(
                invocation = %inv.record.key,
                job_id = %handle.job_id,
                "cancelling job that could not be checkpointed"
            );
            self.cancel_job(connector, &handle).await;
            return Err(e.into());
        }

        tracing::info!(
            invocation = %inv.record.key,
            job_id = %handle.job_id,
            attempt = inv.record.attempt,
            "job submitted"
        );
        self.events.publish(EngineEvent::JobSubmitted {
            step: inv.record.key.step.clone(),
            ordinal: inv.record.key.ordinal,
            job_id: handle.job_id.clone(),
            attempt: inv.record.attempt,
        });
        self.report(&inv.record.key, StepStatus::Running);
        Ok(handle)
    }

    /// Poll until the job reaches a terminal (or unknown) state.
    async fn monitor(
        &self,
        connector: &BoxConnector,
        handle: &JobHandle,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<JobState, InvocationError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut failures = 0u32;
        loop {
            match connector.poll(handle).await {
                Ok(state) if state.is_terminal() || state == JobState::Unknown => return Ok(state),
                Ok(_) => failures = 0,
                Err(e) if e.is_transient() && failures < self.config.max_poll_failures => {
                    failures += 1;
                    tracing::warn!(job_id = %handle.job_id, failures, error = %e, "poll failed");
                }
                Err(e) => return Err(StepExecutionError::Connector(e).into()),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancel_job(connector, handle).await;
                    return Err(InvocationError::Cancelled("cancelled".into()));
                }
                _ = wait_until(deadline) => {
                    self.cancel_job(connector, handle).await;
                    return Err(InvocationError::Cancelled("timed out".into()));
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn cancel_job(&self, connector: &BoxConnector, handle: &JobHandle) {
        if let Err(e) = connector.cancel(handle).await {
            tracing::warn!(job_id = %handle.job_id, error = %e, "job cancel failed");
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
