//! Final run report and process exit codes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::execution::{RunStatus, StepStatus};
use crate::token::Token;

/// Every step succeeded (or was skipped without any failure).
pub const EXIT_SUCCESS: i32 = 0;
/// At least one step failed.
pub const EXIT_STEP_FAILURE: i32 = 1;
/// The run was cancelled.
pub const EXIT_CANCELLED: i32 = 2;
/// The engine stopped on a fatal error.
pub const EXIT_FATAL: i32 = 3;
/// The workflow or configuration was rejected before running.
pub const EXIT_INVALID: i32 = 64;

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub status: StepStatus,
    pub invocations: u64,
    pub failed_invocations: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub workflow: String,
    pub status: RunStatus,
    /// Steps in definition order.
    pub steps: Vec<StepOutcome>,
    /// Tokens on each workflow output port, in sequence order.
    pub outputs: BTreeMap<String, Vec<Token>>,
    /// Physical copies performed during this execution.
    pub transfers: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn step(&self, id: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == id)
    }

    pub fn exit_code(&self) -> i32 {
        match self.status {
            RunStatus::Completed => EXIT_SUCCESS,
            RunStatus::Failed => EXIT_STEP_FAILURE,
            RunStatus::Cancelled => EXIT_CANCELLED,
            RunStatus::Aborted | RunStatus::Running => EXIT_FATAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(status: RunStatus) -> RunReport {
        RunReport {
            run_id: Uuid::now_v7(),
            workflow: "wf".into(),
            status,
            steps: vec![StepOutcome {
                step: "a".into(),
                status: StepStatus::Completed,
                invocations: 1,
                failed_invocations: 0,
                error: None,
            }],
            outputs: BTreeMap::new(),
            transfers: 0,
            error: None,
        }
    }

    #[test]
    fn exit_codes_by_status() {
        assert_eq!(report(RunStatus::Completed).exit_code(), 0);
        assert_eq!(report(RunStatus::Failed).exit_code(), 1);
        assert_eq!(report(RunStatus::Cancelled).exit_code(), 2);
        assert_eq!(report(RunStatus::Aborted).exit_code(), 3);
    }

    #[test]
    fn step_lookup() {
        let r = report(RunStatus::Completed);
        assert_eq!(r.step("a").unwrap().invocations, 1);
        assert!(r.step("b").is_none());
    }
}
