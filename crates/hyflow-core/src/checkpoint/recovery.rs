//! Rebuilding run state from checkpoint records.

use std::collections::{BTreeMap, HashMap};

use hyflow_types::checkpoint::{
    CheckpointPayload, EntityKey, InvocationRecord, RunRecord, StepRecord,
};
use hyflow_types::execution::InvocationKey;
use hyflow_types::token::Token;
use uuid::Uuid;

use super::{CheckpointStore, PersistenceError};

/// Latest durable state of a run.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub run_id: Uuid,
    pub run: RunRecord,
    /// Steps that reached a terminal status.
    pub steps: HashMap<String, StepRecord>,
    pub invocations: BTreeMap<InvocationKey, InvocationRecord>,
    /// Released tokens grouped by port, in sequence order.
    pub tokens: BTreeMap<String, Vec<Token>>,
    /// Latest version of each entity, for continued versioning.
    pub versions: HashMap<EntityKey, u64>,
}

impl Snapshot {
    pub fn tokens_on(&self, port: &str) -> &[Token] {
        self.tokens.get(port).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Invocations of one step, in ordinal order.
    pub fn invocations_of<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a InvocationRecord> + 'a {
        self.invocations.values().filter(move |r| r.key.step == step)
    }
}

/// Load the latest version of every entity of `run_id`.
pub async fn load_snapshot<S: CheckpointStore>(
    store: &S,
    run_id: Uuid,
) -> Result<Snapshot, PersistenceError> {
    let records = store
        .load_latest(run_id)
        .await
        .map_err(PersistenceError::Load)?;

    let mut run = None;
    let mut steps = HashMap::new();
    let mut invocations = BTreeMap::new();
    let mut tokens: BTreeMap<String, Vec<Token>> = BTreeMap::new();
    let mut versions = HashMap::new();

    for record in records {
        versions.insert(record.entity.clone(), record.version);
        match (record.entity, record.payload) {
            (EntityKey::Run, CheckpointPayload::Run(r)) => run = Some(r),
            (EntityKey::Step(id), CheckpointPayload::Step(s)) => {
                steps.insert(id, s);
            }
            (EntityKey::Invocation(key), CheckpointPayload::Invocation(inv)) => {
                invocations.insert(key, inv);
            }
            (EntityKey::Token(_), CheckpointPayload::Token(token)) => {
                tokens.entry(token.port.clone()).or_default().push(token);
            }
            (entity, _) => {
                return Err(PersistenceError::Corrupt(format!(
                    "record for {entity} carries a mismatched payload"
                )));
            }
        }
    }

    let run = run.ok_or(PersistenceError::RunNotFound(run_id))?;
    for log in tokens.values_mut() {
        log.sort_by_key(|t| t.seq);
    }

    tracing::debug!(
        run_id = %run_id,
        steps = steps.len(),
        invocations = invocations.len(),
        ports = tokens.len(),
        "checkpoint snapshot loaded"
    );

    Ok(Snapshot {
        run_id,
        run,
        steps,
        invocations,
        tokens,
        versions,
    })
}
