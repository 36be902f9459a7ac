//! Runtime execution types: statuses, bindings, jobs and copies.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::deployment::{LocationRef, ResourceVector};
use crate::token::{DataRef, Payload, Tag, TerminationReason};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of a step and of each of its invocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Runnable,
    Scheduling,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    /// Progress order of non-terminal states. Terminal states rank highest.
    pub fn rank(self) -> u8 {
        match self {
            StepStatus::Waiting => 0,
            StepStatus::Runnable => 1,
            StepStatus::Scheduling => 2,
            StepStatus::Running => 3,
            _ => 4,
        }
    }

    /// Terminator reason a step with this final status puts on its outputs.
    pub fn termination_reason(self) -> TerminationReason {
        match self {
            StepStatus::Failed => TerminationReason::Failed,
            StepStatus::Skipped => TerminationReason::Skipped,
            StepStatus::Cancelled => TerminationReason::Cancelled,
            _ => TerminationReason::Completed,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Waiting => "waiting",
            StepStatus::Runnable => "runnable",
            StepStatus::Scheduling => "scheduling",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Stopped by a fatal engine error; resumable.
    Aborted,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Invocation identity and binding
// ---------------------------------------------------------------------------

/// Identifies one invocation of a step. The ordinal is the fire order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvocationKey {
    pub step: String,
    pub ordinal: u64,
}

impl InvocationKey {
    pub fn new(step: impl Into<String>, ordinal: u64) -> Self {
        Self {
            step: step.into(),
            ordinal,
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.step, self.ordinal)
    }
}

/// The scheduler's committed placement of one invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub key: InvocationKey,
    /// Bound locations; the first is the primary one.
    pub locations: Vec<LocationRef>,
    /// Resources reserved at each bound location.
    pub grant: ResourceVector,
}

impl Binding {
    pub fn primary(&self) -> Option<&LocationRef> {
        self.locations.first()
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Everything a connector needs to start one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub run_id: Uuid,
    pub key: InvocationKey,
    pub tag: Tag,
    pub attempt: u32,
    pub command: Value,
    /// Staged input payloads by slot name. Data references point at the
    /// primary bound location.
    pub inputs: BTreeMap<String, Payload>,
    /// Output slot names the job must produce.
    pub outputs: Vec<String>,
    pub locations: Vec<LocationRef>,
    pub grant: ResourceVector,
}

/// Opaque connector reference to a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobHandle {
    pub deployment: String,
    pub job_id: String,
}

/// One produced output, keyed by output slot name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    pub slot: String,
    pub payload: Payload,
}

/// Connector view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed { outputs: Vec<ProducedArtifact> },
    Failed { exit_code: Option<i32>, message: String },
    Cancelled,
    /// The connector has no record of the job.
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed { .. } | JobState::Failed { .. } | JobState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Copies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyKind {
    LocalToRemote,
    RemoteToLocal,
    RemoteToRemote,
}

impl fmt::Display for CopyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CopyKind::LocalToRemote => "local_to_remote",
            CopyKind::RemoteToLocal => "remote_to_local",
            CopyKind::RemoteToRemote => "remote_to_remote",
        };
        f.write_str(s)
    }
}

/// A single physical copy handed to a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyRequest {
    pub kind: CopyKind,
    pub source: DataRef,
    pub destination: LocationRef,
}
