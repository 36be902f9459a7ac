//! Job retry and timeout policy.
//!
//! Stateless: every decision is a function of the step's policy and the
//! executor configuration.

use std::time::Duration;

use hyflow_types::config::ExecutorConfig;
use hyflow_types::workflow::{RetryPolicy, StepDefinition};

pub struct RetryHandler;

impl RetryHandler {
    /// Whether a job that failed on `attempt` (1-based) gets another submit.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts.max(1)
    }

    /// Job timeout for a step. The step's own setting wins; a zero engine
    /// default disables the timeout.
    pub fn timeout(step: &StepDefinition, config: &ExecutorConfig) -> Option<Duration> {
        match step.timeout_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None if config.default_step_timeout_secs > 0 => {
                Some(Duration::from_secs(config.default_step_timeout_secs))
            }
            None => None,
        }
    }
}
