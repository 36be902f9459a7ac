//! SQLite checkpoint store.
//!
//! Implements `CheckpointStore` from `hyflow-core`. Each record is one row of
//! the append-only `checkpoints` table, keyed by `(run_id, entity, version)`,
//! with the payload stored as a JSON blob. Appends are a single conditional
//! INSERT so a stale version can never land, even with concurrent writers.

use chrono::{DateTime, Utc};
use hyflow_core::checkpoint::CheckpointStore;
use hyflow_types::checkpoint::{CheckpointPayload, CheckpointRecord, EntityKey, RunSummary};
use hyflow_types::error::StoreError;
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct CheckpointRow {
    run_id: String,
    entity: String,
    version: i64,
    payload: String,
    recorded_at: String,
}

impl CheckpointRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            entity: row.try_get("entity")?,
            version: row.try_get("version")?,
            payload: row.try_get("payload")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }

    fn into_record(self) -> Result<CheckpointRecord, StoreError> {
        let entity: EntityKey = self
            .entity
            .parse()
            .map_err(|e| StoreError::Serialization(format!("{e}")))?;
        let payload: CheckpointPayload = serde_json::from_str(&self.payload)
            .map_err(|e| StoreError::Serialization(format!("invalid payload for {entity}: {e}")))?;
        Ok(CheckpointRecord {
            run_id: parse_uuid(&self.run_id)?,
            entity,
            version: u64::try_from(self.version)
                .map_err(|_| StoreError::Serialization(format!("negative version {}", self.version)))?,
            payload,
            recorded_at: parse_datetime(&self.recorded_at)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    s.parse::<Uuid>()
        .map_err(|e| StoreError::Serialization(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("invalid datetime: {e}")))
}

fn payload_kind(payload: &CheckpointPayload) -> &'static str {
    match payload {
        CheckpointPayload::Run(_) => "run",
        CheckpointPayload::Step(_) => "step",
        CheckpointPayload::Invocation(_) => "invocation",
        CheckpointPayload::Token(_) => "token",
    }
}

fn query_error(e: sqlx::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// CheckpointStore impl
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn append(&self, record: &CheckpointRecord) -> Result<(), StoreError> {
        let payload = serde_json::to_string(&record.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let version = i64::try_from(record.version)
            .map_err(|_| StoreError::Serialization(format!("version {} out of range", record.version)))?;
        let run_id = record.run_id.to_string();
        let entity = record.entity.to_string();

        let result = sqlx::query(
            r#"INSERT INTO checkpoints (run_id, entity, version, kind, payload, recorded_at)
               SELECT ?, ?, ?, ?, ?, ?
               WHERE NOT EXISTS (
                   SELECT 1 FROM checkpoints WHERE run_id = ? AND entity = ? AND version >= ?
               )"#,
        )
        .bind(&run_id)
        .bind(&entity)
        .bind(version)
        .bind(payload_kind(&record.payload))
        .bind(&payload)
        .bind(record.recorded_at.to_rfc3339())
        .bind(&run_id)
        .bind(&entity)
        .bind(version)
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "{entity} version {} is not newer than the stored version",
                record.version
            )));
        }
        Ok(())
    }

    async fn load_latest(&self, run_id: Uuid) -> Result<Vec<CheckpointRecord>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT c.run_id, c.entity, c.version, c.payload, c.recorded_at
               FROM checkpoints c
               JOIN (
                   SELECT entity, MAX(version) AS version
                   FROM checkpoints WHERE run_id = ?
                   GROUP BY entity
               ) latest ON c.entity = latest.entity AND c.version = latest.version
               WHERE c.run_id = ?
               ORDER BY c.entity"#,
        )
        .bind(run_id.to_string())
        .bind(run_id.to_string())
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        rows.iter()
            .map(|row| CheckpointRow::from_row(row).map_err(query_error)?.into_record())
            .collect()
    }

    async fn list_runs(&self) -> Result<Vec<RunSummary>, StoreError> {
        let rows = sqlx::query(
            r#"SELECT c.run_id, c.entity, c.version, c.payload, c.recorded_at
               FROM checkpoints c
               WHERE c.kind = 'run'
                 AND c.version = (
                     SELECT MAX(version) FROM checkpoints
                     WHERE run_id = c.run_id AND entity = c.entity
                 )"#,
        )
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = CheckpointRow::from_row(row).map_err(query_error)?.into_record()?;
            match &record.payload {
                CheckpointPayload::Run(run) => summaries.push(RunSummary::from_record(record.run_id, run)),
                other => {
                    tracing::warn!(run_id = %record.run_id, kind = payload_kind(other), "run row with unexpected payload");
                }
            }
        }
        summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::pool::database_url;
    use hyflow_core::checkpoint::{CheckpointManager, load_snapshot};
    use hyflow_types::checkpoint::{InvocationRecord, RunRecord, StepRecord};
    use hyflow_types::execution::{InvocationKey, RunStatus, StepStatus};
    use hyflow_types::token::{Payload, Tag, Token};
    use hyflow_types::workflow::WorkflowDefinition;
    use std::collections::BTreeMap;

    async fn test_store() -> (SqliteCheckpointStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url(dir.path(), "test.db")).await.unwrap();
        (SqliteCheckpointStore::new(pool), dir)
    }

    fn workflow() -> WorkflowDefinition {
        serde_yaml_ng::from_str("name: wf\nports: []\nsteps: [{id: a}]").unwrap()
    }

    fn run_record(status: RunStatus) -> RunRecord {
        RunRecord {
            workflow: workflow(),
            status,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn record(run_id: Uuid, entity: EntityKey, version: u64, payload: CheckpointPayload) -> CheckpointRecord {
        CheckpointRecord {
            run_id,
            entity,
            version,
            payload,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_load_latest() {
        let (store, _dir) = test_store().await;
        let run_id = Uuid::now_v7();

        for (version, status) in [(1, RunStatus::Running), (2, RunStatus::Completed)] {
            store
                .append(&record(run_id, EntityKey::Run, version, CheckpointPayload::Run(run_record(status))))
                .await
                .unwrap();
        }
        let step = StepRecord {
            status: StepStatus::Completed,
            reason: None,
        };
        store
            .append(&record(run_id, EntityKey::Step("a".into()), 1, CheckpointPayload::Step(step)))
            .await
            .unwrap();

        let latest = store.load_latest(run_id).await.unwrap();
        assert_eq!(latest.len(), 2);
        let run = latest.iter().find(|r| r.entity == EntityKey::Run).unwrap();
        assert_eq!(run.version, 2);
        assert!(matches!(&run.payload, CheckpointPayload::Run(r) if r.status == RunStatus::Completed));

        assert!(store.load_latest(Uuid::now_v7()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (store, _dir) = test_store().await;
        let run_id = Uuid::now_v7();
        let payload = CheckpointPayload::Run(run_record(RunStatus::Running));

        store.append(&record(run_id, EntityKey::Run, 3, payload.clone())).await.unwrap();
        let err = store
            .append(&record(run_id, EntityKey::Run, 3, payload.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let err = store
            .append(&record(run_id, EntityKey::Run, 2, payload.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // Other runs version independently.
        store.append(&record(Uuid::now_v7(), EntityKey::Run, 1, payload)).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_runs_most_recent_first() {
        let (store, _dir) = test_store().await;
        let older = Uuid::now_v7();
        let newer = Uuid::now_v7();

        let mut first = run_record(RunStatus::Running);
        first.started_at = Utc::now() - chrono::Duration::minutes(5);
        store.append(&record(older, EntityKey::Run, 1, CheckpointPayload::Run(first.clone()))).await.unwrap();
        first.status = RunStatus::Failed;
        first.error = Some("failed steps: a".into());
        store.append(&record(older, EntityKey::Run, 2, CheckpointPayload::Run(first))).await.unwrap();
        store
            .append(&record(newer, EntityKey::Run, 1, CheckpointPayload::Run(run_record(RunStatus::Running))))
            .await
            .unwrap();

        let runs = store.list_runs().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].run_id, newer);
        assert_eq!(runs[1].run_id, older);
        assert_eq!(runs[1].status, RunStatus::Failed);
        assert_eq!(runs[1].error.as_deref(), Some("failed steps: a"));
        assert_eq!(runs[1].workflow_name, "wf");
    }

    #[tokio::test]
    async fn test_snapshot_through_checkpoint_manager() {
        let (store, _dir) = test_store().await;
        let run_id = Uuid::now_v7();
        let manager = CheckpointManager::new(store.clone(), run_id);

        manager.record_run(&run_record(RunStatus::Running)).await.unwrap();
        let mut token = Token::new("p", Tag::root(), Payload::Value(serde_json::json!(7)));
        token.seq = 0;
        manager.record_token(&token).await.unwrap();
        let mut inv = InvocationRecord::fired(InvocationKey::new("a", 0), Tag::root(), BTreeMap::new());
        manager.record_invocation(&inv).await.unwrap();
        inv.status = StepStatus::Completed;
        inv.outputs = vec![token.clone()];
        manager.record_invocation(&inv).await.unwrap();

        let snapshot = load_snapshot(&store, run_id).await.unwrap();
        assert_eq!(snapshot.run.status, RunStatus::Running);
        assert_eq!(snapshot.tokens_on("p"), &[token]);
        let restored = &snapshot.invocations[&InvocationKey::new("a", 0)];
        assert_eq!(restored.status, StepStatus::Completed);
        assert_eq!(snapshot.versions[&EntityKey::Invocation(InvocationKey::new("a", 0))], 2);
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(dir.path(), "reopen.db");
        let run_id = Uuid::now_v7();
        {
            let store = SqliteCheckpointStore::new(DatabasePool::new(&url).await.unwrap());
            store
                .append(&record(run_id, EntityKey::Run, 1, CheckpointPayload::Run(run_record(RunStatus::Running))))
                .await
                .unwrap();
        }
        let store = SqliteCheckpointStore::new(DatabasePool::new(&url).await.unwrap());
        assert_eq!(store.load_latest(run_id).await.unwrap().len(), 1);
    }
}
