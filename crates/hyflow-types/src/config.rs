//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every field
//! has a default so an empty or missing file is valid.

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
}

/// Backoff while no location can take an invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Timed retries before giving up with a scheduling error.
    #[serde(default = "default_scheduler_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_scheduler_max_retries() -> u32 {
    120
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: default_scheduler_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Attempts per physical copy before the transfer fails.
    #[serde(default = "default_transfer_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_transfer_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_transfer_attempts() -> u32 {
    3
}

fn default_transfer_backoff_ms() -> u64 {
    500
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_transfer_attempts(),
            retry_backoff_ms: default_transfer_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Consecutive transient poll failures tolerated per job.
    #[serde(default = "default_max_poll_failures")]
    pub max_poll_failures: u32,
    /// Job timeout for steps that do not set one. Zero disables it.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_max_poll_failures() -> u32 {
    5
}

fn default_step_timeout_secs() -> u64 {
    0
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_poll_failures: default_max_poll_failures(),
            default_step_timeout_secs: default_step_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// SQLite file name inside the data directory.
    #[serde(default = "default_database_file")]
    pub database_file: String,
}

fn default_database_file() -> String {
    "hyflow.db".to_string()
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            database_file: default_database_file(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.scheduler.max_retries, 120);
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(config.executor.poll_interval_ms, 1_000);
        assert_eq!(config.executor.default_step_timeout_secs, 0);
        assert_eq!(config.checkpoint.database_file, "hyflow.db");
    }

    #[test]
    fn test_engine_config_deserialize_empty() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.initial_backoff_ms, 200);
        assert!((config.scheduler.backoff_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_engine_config_deserialize_partial_sections() {
        let toml_str = r#"
[scheduler]
max_retries = 3

[executor]
poll_interval_ms = 50
default_step_timeout_secs = 600
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_retries, 3);
        assert_eq!(config.scheduler.max_backoff_ms, 30_000);
        assert_eq!(config.executor.poll_interval_ms, 50);
        assert_eq!(config.executor.max_poll_failures, 5);
        assert_eq!(config.executor.default_step_timeout_secs, 600);
        assert_eq!(config.transfer.retry_backoff_ms, 500);
    }
}
