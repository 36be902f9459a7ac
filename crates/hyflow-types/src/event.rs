//! Events published by the engine while a run progresses.
//!
//! All variants are Clone + Send + Sync for use with tokio broadcast channels.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deployment::LocationRef;
use crate::execution::{CopyKind, RunStatus, StepStatus};
use crate::token::Tag;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    RunStarted {
        run_id: Uuid,
        workflow: String,
        resumed: bool,
    },

    /// Aggregate status of a step changed.
    StepStatusChanged { step: String, status: StepStatus },

    InvocationFired {
        step: String,
        ordinal: u64,
        tag: Tag,
    },

    InvocationBound {
        step: String,
        ordinal: u64,
        locations: Vec<LocationRef>,
    },

    JobSubmitted {
        step: String,
        ordinal: u64,
        job_id: String,
        attempt: u32,
    },

    InvocationFinished {
        step: String,
        ordinal: u64,
        status: StepStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// A physical copy completed.
    DataCopied {
        token_id: Uuid,
        kind: CopyKind,
        source: LocationRef,
        destination: LocationRef,
        bytes: u64,
    },

    RunFinished { run_id: Uuid, status: RunStatus },
}
