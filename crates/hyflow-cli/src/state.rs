//! Application state shared by the command handlers.

use std::path::PathBuf;

use anyhow::Context;
use hyflow_infra::config::load_engine_config;
use hyflow_infra::filesystem::{ensure_data_dir, resolve_data_dir};
use hyflow_infra::sqlite::{DatabasePool, SqliteCheckpointStore, database_url};
use hyflow_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub store: SqliteCheckpointStore,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the
    /// checkpoint database (running migrations).
    pub async fn init(data_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        ensure_data_dir(&data_dir)
            .await
            .with_context(|| format!("Failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;

        let db_url = database_url(&data_dir, &config.checkpoint.database_file);
        let pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("Failed to open checkpoint database {db_url}"))?;
        tracing::debug!(data_dir = %data_dir.display(), "checkpoint database ready");

        Ok(Self {
            data_dir,
            config,
            store: SqliteCheckpointStore::new(pool),
        })
    }
}
