//! Durable checkpoint records.
//!
//! Every durable transition is written as a new version of one entity's full
//! state. Restart reads back the latest version of each entity.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ParseError;
use crate::execution::{Binding, InvocationKey, JobHandle, RunStatus, StepStatus};
use crate::token::{Tag, Token};
use crate::workflow::WorkflowDefinition;

/// Which entity a checkpoint record describes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EntityKey {
    Run,
    Step(String),
    Invocation(InvocationKey),
    Token(Uuid),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Run => f.write_str("run"),
            EntityKey::Step(id) => write!(f, "step:{id}"),
            EntityKey::Invocation(key) => write!(f, "invocation:{key}"),
            EntityKey::Token(id) => write!(f, "token:{id}"),
        }
    }
}

impl FromStr for EntityKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseError::InvalidEntityKey(s.to_string());
        if s == "run" {
            return Ok(EntityKey::Run);
        }
        let (kind, rest) = s.split_once(':').ok_or_else(invalid)?;
        match kind {
            "step" if !rest.is_empty() => Ok(EntityKey::Step(rest.to_string())),
            "invocation" => {
                let (step, ordinal) = rest.rsplit_once('#').ok_or_else(invalid)?;
                let ordinal = ordinal.parse().map_err(|_| invalid())?;
                Ok(EntityKey::Invocation(InvocationKey::new(step, ordinal)))
            }
            "token" => Uuid::parse_str(rest).map(EntityKey::Token).map_err(|_| invalid()),
            _ => Err(invalid()),
        }
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for EntityKey {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

// ---------------------------------------------------------------------------
// Entity states
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// The graph this run executes, kept so the run can be resumed by id.
    pub workflow: WorkflowDefinition,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Full state of one invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub key: InvocationKey,
    pub tag: Tag,
    /// Input tokens by slot name, as fired.
    pub inputs: BTreeMap<String, Token>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobHandle>,
    #[serde(default)]
    pub attempt: u32,
    /// Output tokens, ids assigned, recorded when the invocation finishes.
    #[serde(default)]
    pub outputs: Vec<Token>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Outputs (or the empty slot of a failed invocation) have passed the join.
    #[serde(default)]
    pub released: bool,
}

impl InvocationRecord {
    pub fn fired(key: InvocationKey, tag: Tag, inputs: BTreeMap<String, Token>) -> Self {
        Self {
            key,
            tag,
            inputs,
            status: StepStatus::Runnable,
            binding: None,
            job: None,
            attempt: 0,
            outputs: Vec::new(),
            error: None,
            released: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointPayload {
    Run(RunRecord),
    Step(StepRecord),
    Invocation(InvocationRecord),
    /// A token released to its port, with its sequence number.
    Token(Token),
}

/// One version of one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub run_id: Uuid,
    pub entity: EntityKey,
    pub version: u64,
    pub payload: CheckpointPayload,
    pub recorded_at: DateTime<Utc>,
}

/// Listing entry for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn from_record(run_id: Uuid, record: &RunRecord) -> Self {
        Self {
            run_id,
            workflow_name: record.workflow.name.clone(),
            status: record.status,
            started_at: record.started_at,
            finished_at: record.finished_at,
            error: record.error.clone(),
        }
    }
}
