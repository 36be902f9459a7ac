//! In-memory checkpoint store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use hyflow_types::checkpoint::{CheckpointPayload, CheckpointRecord, EntityKey, RunSummary};
use hyflow_types::error::StoreError;
use uuid::Uuid;

use super::CheckpointStore;

/// Volatile store for tests and dry runs. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryCheckpointStore {
    records: Arc<Mutex<Vec<CheckpointRecord>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record in append order.
    pub fn records(&self) -> Vec<CheckpointRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    async fn append(&self, record: &CheckpointRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Connection)?;
        let stale = records.iter().any(|r| {
            r.run_id == record.run_id && r.entity == record.entity && r.version >= record.version
        });
        if stale {
            return Err(StoreError::Conflict(format!(
                "{} version {} is not newer than the stored version",
                record.entity, record.version
            )));
        }
        records.push(record.clone());
        Ok(())
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Vec<CheckpointRecord>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Connection)?;
        let mut latest: HashMap<&EntityKey, &CheckpointRecord> = HashMap::new();
        for record in records.iter().filter(|r| r.run_id == run_id) {
            match latest.get(&record.entity) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    latest.insert(&record.entity, record);
                }
            }
        }
        Ok(latest.into_values().cloned().collect())
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Connection)?;
        let mut runs: HashMap<Uuid, &CheckpointRecord> = HashMap::new();
        for record in records.iter().filter(|r| r.entity == EntityKey::Run) {
            match runs.get(&record.run_id) {
                Some(existing) if existing.version >= record.version => {}
                _ => {
                    runs.insert(record.run_id, record);
                }
            }
        }
        let mut summaries: Vec<RunSummary> = runs
            .into_iter()
            .filter_map(|(run_id, record)| match &record.payload {
                CheckpointPayload::Run(run) => Some(RunSummary::from_record(run_id, run)),
                _ => None,
            })
            .collect();
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }
}

/// Store wrapper that starts failing once a predicate matches, simulating a
/// crash at a chosen point. Every later append fails too.
#[cfg(test)]
pub(crate) struct FailingStore {
    inner: MemoryCheckpointStore,
    trip: Box<dyn Fn(&CheckpointRecord) -> bool + Send + Sync>,
    tripped: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl FailingStore {
    pub(crate) fn new(
        inner: MemoryCheckpointStore,
        trip: impl Fn(&CheckpointRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            trip: Box::new(trip),
            tripped: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[cfg(test)]
impl CheckpointStore for FailingStore {
    async fn append(&self, record: &CheckpointRecord) -> Result<(), StoreError> {
        use std::sync::atomic::Ordering;
        if self.tripped.load(Ordering::SeqCst) || (self.trip)(record) {
            self.tripped.store(true, Ordering::SeqCst);
            return Err(StoreError::Connection);
        }
        self.inner.append(record).await
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Vec<CheckpointRecord>, StoreError> {
        self.inner.load_latest(run_id).await
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        self.inner.list_runs().await
    }
}
