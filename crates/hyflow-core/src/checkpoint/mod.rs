//! Durable checkpoint manager for run state.
//!
//! Wraps a [`CheckpointStore`] and is the only writer of checkpoint records.
//! Each durable transition (run status, step terminal status, invocation
//! fired/bound/submitted/finished/released, token released) is appended as a
//! new version of the entity's full state before the transition becomes
//! visible to the rest of the engine. A failed write is fatal to the run.

pub mod memory;
pub mod recovery;

use std::collections::HashMap;
use std::future::Future;

use chrono::Utc;
use dashmap::DashMap;
use hyflow_types::checkpoint::{
    CheckpointPayload, CheckpointRecord, EntityKey, InvocationRecord, RunRecord, RunSummary,
    StepRecord,
};
use hyflow_types::error::StoreError;
use hyflow_types::token::Token;
use uuid::Uuid;

pub use memory::MemoryCheckpointStore;
pub use recovery::{Snapshot, load_snapshot};

// ---------------------------------------------------------------------------
// CheckpointStore trait
// ---------------------------------------------------------------------------

/// Append-only storage for checkpoint records.
///
/// Implementations must reject a record whose version is not greater than the
/// latest stored version of the same entity.
pub trait CheckpointStore: Send + Sync + 'static {
    fn append(
        &self,
        record: &CheckpointRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// The latest version of every entity recorded for a run.
    fn load_latest(
        &self,
        run_id: Uuid,
    ) -> impl Future<Output = Result<Vec<CheckpointRecord>, StoreError>> + Send;

    /// Every run with a run record, most recent first.
    fn list_runs(&self) -> impl Future<Output = Result<Vec<RunSummary>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("failed to persist {entity}: {source}")]
    Write {
        entity: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to load checkpoints: {0}")]
    Load(#[source] StoreError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("corrupt checkpoint: {0}")]
    Corrupt(String),
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Assigns per-entity versions and writes records for one run.
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
    run_id: Uuid,
    versions: DashMap<EntityKey, u64>,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    pub fn new(store: S, run_id: Uuid) -> Self {
        Self {
            store,
            run_id,
            versions: DashMap::new(),
        }
    }

    /// Continue versioning from the latest versions of a restored run.
    pub fn resuming(store: S, run_id: Uuid, versions: HashMap<EntityKey, u64>) -> Self {
        Self {
            store,
            run_id,
            versions: versions.into_iter().collect(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn write(&self, entity: EntityKey, payload: CheckpointPayload) -> Result<u64, PersistenceError> {
        let version = {
            let mut current = self.versions.entry(entity.clone()).or_insert(0);
            *current += 1;
            *current
        };
        let record = CheckpointRecord {
            run_id: self.run_id,
            entity,
            version,
            payload,
            recorded_at: Utc::now(),
        };
        self.store
            .append(&record)
            .await
            .map_err(|source| PersistenceError::Write {
                entity: record.entity.to_string(),
                source,
            })?;

        tracing::debug!(
            run_id = %self.run_id,
            entity = %record.entity,
            version,
            "checkpoint written"
        );
        Ok(version)
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<(), PersistenceError> {
        self.write(EntityKey::Run, CheckpointPayload::Run(run.clone()))
            .await
            .map(|_| ())
    }

    pub async fn record_step(&self, step: &str, record: &StepRecord) -> Result<(), PersistenceError> {
        self.write(EntityKey::Step(step.to_string()), CheckpointPayload::Step(record.clone()))
            .await
            .map(|_| ())
    }

    pub async fn record_invocation(&self, record: &InvocationRecord) -> Result<(), PersistenceError> {
        self.write(
            EntityKey::Invocation(record.key.clone()),
            CheckpointPayload::Invocation(record.clone()),
        )
        .await
        .map(|_| ())
    }

    /// Record a token released to its port, sequence number included.
    pub async fn record_token(&self, token: &Token) -> Result<(), PersistenceError> {
        self.write(EntityKey::Token(token.id), CheckpointPayload::Token(token.clone()))
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyflow_types::execution::{InvocationKey, StepStatus};
    use hyflow_types::token::{Payload, Tag};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn versions_increase_per_entity() {
        let store = MemoryCheckpointStore::new();
        let manager = CheckpointManager::new(store.clone(), Uuid::now_v7());

        let mut record =
            InvocationRecord::fired(InvocationKey::new("a", 0), Tag::root(), BTreeMap::new());
        manager.record_invocation(&record).await.unwrap();
        record.status = StepStatus::Running;
        manager.record_invocation(&record).await.unwrap();
        manager
            .record_step("a", &StepRecord { status: StepStatus::Completed, reason: None })
            .await
            .unwrap();

        let records = store.records();
        let versions: Vec<(String, u64)> = records
            .iter()
            .map(|r| (r.entity.to_string(), r.version))
            .collect();
        assert_eq!(
            versions,
            vec![
                ("invocation:a#0".to_string(), 1),
                ("invocation:a#0".to_string(), 2),
                ("step:a".to_string(), 1),
            ]
        );
    }

    #[tokio::test]
    async fn resuming_continues_after_restored_versions() {
        let store = MemoryCheckpointStore::new();
        let run_id = Uuid::now_v7();
        let token = Token::new("p", Tag::root(), Payload::Value(serde_json::json!(1)));
        let mut versions = HashMap::new();
        versions.insert(EntityKey::Token(token.id), 4);

        let manager = CheckpointManager::resuming(store.clone(), run_id, versions);
        manager.record_token(&token).await.unwrap();
        assert_eq!(store.records()[0].version, 5);
    }

    #[tokio::test]
    async fn store_failure_is_a_persistence_error() {
        let store = memory::FailingStore::new(MemoryCheckpointStore::new(), |_| true);
        let manager = CheckpointManager::new(store, Uuid::now_v7());
        let err = manager
            .record_step("a", &StepRecord { status: StepStatus::Failed, reason: None })
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::Write { .. }));
        assert!(err.to_string().contains("step:a"));
    }
}
