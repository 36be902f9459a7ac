//! Top-level engine error.

use hyflow_types::report::{EXIT_FATAL, EXIT_INVALID};

use crate::checkpoint::PersistenceError;
use crate::connector::ConnectorError;
use crate::executor::StepExecutionError;
use crate::graph::WorkflowError;
use crate::scheduler::SchedulingError;
use crate::transfer::DataTransferError;

/// Errors that stop a run (or prevent it from starting).
///
/// Failures of individual invocations do not surface here; they are recorded
/// on the step and reflected in the run report.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Scheduling(#[from] SchedulingError),

    #[error(transparent)]
    Transfer(#[from] DataTransferError),

    #[error(transparent)]
    Execution(#[from] StepExecutionError),

    #[error("deployment failed: {0}")]
    Connector(#[from] ConnectorError),

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Process exit code for a run that ended with this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::InvalidWorkflow(_) => EXIT_INVALID,
            _ => EXIT_FATAL,
        }
    }
}
