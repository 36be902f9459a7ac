//! SQLite storage layer.
//!
//! Checkpoint store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod checkpoint;
pub mod pool;

pub use checkpoint::SqliteCheckpointStore;
pub use pool::{DatabasePool, database_url};
