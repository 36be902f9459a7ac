//! Execution Graph Engine.
//!
//! [`Engine`] owns one run: its ports, steps, scheduler, transfers and
//! checkpoint. Construct it with [`Engine::new`] for a fresh run or
//! [`Engine::resume`] to continue a checkpointed one, then call
//! [`Engine::run`], which drives the graph until every step is terminal and
//! returns the [`RunReport`].
//!
//! # Execution flow
//!
//! 1. Record the run and deploy every connector.
//! 2. Place initial input tokens and fire source steps.
//! 3. Each fired invocation runs in its own task (bind, stage, submit, poll).
//! 4. Finished invocations release their tokens in fire order; downstream
//!    steps fire as their inputs match.
//! 5. Steps finalize once their inputs are exhausted and nothing is in flight.
//! 6. Undeploy and record the final run status.

mod driver;
mod state;


use std::sync::Arc;

use chrono::Utc;
use hyflow_types::checkpoint::RunRecord;
use hyflow_types::config::EngineConfig;
use hyflow_types::deployment::DeploymentConfig;
use hyflow_types::event::EngineEvent;
use hyflow_types::execution::RunStatus;
use hyflow_types::report::RunReport;
use hyflow_types::workflow::WorkflowDefinition;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::checkpoint::{CheckpointManager, CheckpointStore, Snapshot, load_snapshot};
use crate::connector::{ConnectorError, ConnectorRegistry};
use crate::error::EngineError;
use crate::event::EventBus;
use crate::executor::StepExecutor;
use crate::graph::validate_definition;
use crate::scheduler::Scheduler;
use crate::transfer::TransferManager;

use driver::Driver;

pub struct Engine<S: CheckpointStore> {
    definition: Arc<WorkflowDefinition>,
    deployments: Vec<DeploymentConfig>,
    registry: Arc<ConnectorRegistry>,
    checkpoint: Arc<CheckpointManager<S>>,
    config: EngineConfig,
    events: EventBus,
    cancel: CancellationToken,
    snapshot: Option<Snapshot>,
}

impl<S: CheckpointStore> Engine<S> {
    /// Prepare a fresh run of `definition`.
    pub fn new(
        definition: WorkflowDefinition,
        deployments: Vec<DeploymentConfig>,
        registry: Arc<ConnectorRegistry>,
        store: S,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        validate_definition(&definition)?;
        check_connectors(&deployments, &registry)?;
        let run_id = Uuid::now_v7();
        Ok(Self {
            definition: Arc::new(definition),
            deployments,
            registry,
            checkpoint: Arc::new(CheckpointManager::new(store, run_id)),
            config,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            snapshot: None,
        })
    }

    /// Prepare to continue a checkpointed run. Without an explicit
    /// definition the one stored with the run is used.
    pub async fn resume(
        run_id: Uuid,
        definition: Option<WorkflowDefinition>,
        deployments: Vec<DeploymentConfig>,
        registry: Arc<ConnectorRegistry>,
        store: S,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let snapshot = load_snapshot(&store, run_id).await?;
        let definition = definition.unwrap_or_else(|| snapshot.run.workflow.clone());
        validate_definition(&definition)?;
        check_connectors(&deployments, &registry)?;
        let checkpoint = CheckpointManager::resuming(store, run_id, snapshot.versions.clone());
        Ok(Self {
            definition: Arc::new(definition),
            deployments,
            registry,
            checkpoint: Arc::new(checkpoint),
            config,
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            snapshot: Some(snapshot),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.checkpoint.run_id()
    }

    /// Cancelling this token cancels the whole run.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Execute the run to completion.
    ///
    /// Step failures are reported in the returned [`RunReport`]; an `Err`
    /// means the engine itself stopped (persistence failure, deployment
    /// failure).
    pub async fn run(self) -> Result<RunReport, EngineError> {
        let run_id = self.run_id();
        let resumed = self.snapshot.is_some();
        let mut run = RunRecord {
            workflow: (*self.definition).clone(),
            status: RunStatus::Running,
            error: None,
            started_at: self
                .snapshot
                .as_ref()
                .map(|s| s.run.started_at)
                .unwrap_or_else(Utc::now),
            finished_at: None,
        };
        self.checkpoint.record_run(&run).await?;
        tracing::info!(run_id = %run_id, workflow = %self.definition.name, resumed, "run started");
        self.events.publish(EngineEvent::RunStarted {
            run_id,
            workflow: self.definition.name.clone(),
            resumed,
        });

        if let Err(e) = self.registry.deploy_all().await {
            self.registry.undeploy_all().await;
            return Err(self.abort_run(run, e.into()).await);
        }

        let scheduler = Arc::new(Scheduler::new(&self.deployments, self.config.scheduler.clone()));
        scheduler.refresh_capacity(&self.registry).await;
        let transfers = Arc::new(TransferManager::new(
            self.registry.clone(),
            self.config.transfer.clone(),
            self.events.clone(),
        ));
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let executor = Arc::new(StepExecutor::new(
            scheduler,
            transfers.clone(),
            self.registry.clone(),
            self.checkpoint.clone(),
            self.events.clone(),
            self.config.executor.clone(),
            progress_tx,
        ));

        let result = match Driver::new(
            self.definition.clone(),
            self.checkpoint.clone(),
            executor,
            transfers.clone(),
            self.events.clone(),
            self.cancel.clone(),
            progress_rx,
        ) {
            Ok(driver) => driver.run(self.snapshot.clone()).await,
            Err(e) => Err(e),
        };
        self.registry.undeploy_all().await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.abort_run(run, e).await),
        };

        run.status = outcome.status;
        run.finished_at = Some(Utc::now());
        let failed: Vec<&str> = outcome
            .steps
            .iter()
            .filter(|s| s.status == hyflow_types::execution::StepStatus::Failed)
            .map(|s| s.step.as_str())
            .collect();
        if !failed.is_empty() {
            run.error = Some(format!("failed steps: {}", failed.join(", ")));
        }
        self.checkpoint.record_run(&run).await?;

        tracing::info!(run_id = %run_id, status = %outcome.status, transfers = transfers.copy_count(), "run finished");
        self.events.publish(EngineEvent::RunFinished {
            run_id,
            status: outcome.status,
        });

        Ok(RunReport {
            run_id,
            workflow: self.definition.name.clone(),
            status: outcome.status,
            steps: outcome.steps,
            outputs: outcome.outputs,
            transfers: transfers.copy_count(),
            error: run.error,
        })
    }

    async fn abort_run(&self, mut run: RunRecord, error: EngineError) -> EngineError {
        tracing::error!(run_id = %self.run_id(), error = %error, "run aborted");
        run.status = RunStatus::Aborted;
        run.error = Some(error.to_string());
        run.finished_at = Some(Utc::now());
        if let Err(e) = self.checkpoint.record_run(&run).await {
            tracing::warn!(error = %e, "could not record aborted run status");
        }
        self.events.publish(EngineEvent::RunFinished {
            run_id: self.run_id(),
            status: RunStatus::Aborted,
        });
        error
    }
}

fn check_connectors(deployments: &[DeploymentConfig], registry: &ConnectorRegistry) -> Result<(), EngineError> {
    match deployments.iter().find(|d| registry.get(&d.name).is_none()) {
        Some(missing) => Err(ConnectorError::Deployment(format!(
            "no connector registered for deployment '{}'",
            missing.name
        ))
        .into()),
        None => Ok(()),
    }
}
