//! Data directory layout.
//!
//! The data directory holds `config.toml`, the checkpoint database and the
//! default roots of local deployments.

use std::path::{Path, PathBuf};

/// Resolve the data directory.
///
/// Priority:
/// 1. `HYFLOW_DATA_DIR` environment variable
/// 2. `~/.hyflow`
/// 3. `.hyflow` in the current directory
pub fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HYFLOW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    if let Some(home) = dirs::home_dir() {
        return home.join(".hyflow");
    }

    PathBuf::from(".hyflow")
}

/// Create the data directory if it does not exist yet.
pub async fn ensure_data_dir(data_dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(data_dir).await
}

/// Default root for a local deployment that does not configure one:
/// `{data_dir}/deployments/{name}`.
pub fn deployment_root(data_dir: &Path, deployment: &str) -> PathBuf {
    data_dir.join("deployments").join(deployment)
}
