//! Orchestrator configuration

use crate::checkpoint::Decision;
use crate::error::{Error, Result};
use std::time::Duration;

/// Bounds and timeouts applied to every session
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retries per step after the first attempt
    pub max_step_retries: u32,
    /// Replans (and plan rejections) per session
    pub max_replans: u32,
    /// Edit rounds on one plan approval before the edit is auto-accepted
    pub max_edit_rounds: u32,
    /// Bound on each worker call
    pub worker_timeout: Duration,
    /// Bound on each plan generator call
    pub plan_timeout: Duration,
    /// How long a checkpoint waits for a human
    pub checkpoint_timeout: Duration,
    /// Decision applied when a checkpoint times out
    pub checkpoint_default: Decision,
    /// Write a learned plan record when a session completes
    pub learn_plans: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 2,
            max_replans: 2,
            max_edit_rounds: 2,
            worker_timeout: Duration::from_secs(120),
            plan_timeout: Duration::from_secs(120),
            checkpoint_timeout: Duration::from_secs(600),
            checkpoint_default: Decision::Rejected,
            learn_plans: true,
        }
    }
}

impl OrchestratorConfig {
    /// Create default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set step retries
    #[must_use]
    pub fn with_max_step_retries(mut self, retries: u32) -> Self {
        self.max_step_retries = retries;
        self
    }

    /// Set the replan budget
    #[must_use]
    pub fn with_max_replans(mut self, replans: u32) -> Self {
        self.max_replans = replans;
        self
    }

    /// Set the edit round limit
    #[must_use]
    pub fn with_max_edit_rounds(mut self, rounds: u32) -> Self {
        self.max_edit_rounds = rounds;
        self
    }

    /// Set the worker call timeout
    #[must_use]
    pub fn with_worker_timeout(mut self, timeout: Duration) -> Self {
        self.worker_timeout = timeout;
        self
    }

    /// Set the plan generation timeout
    #[must_use]
    pub fn with_plan_timeout(mut self, timeout: Duration) -> Self {
        self.plan_timeout = timeout;
        self
    }

    /// Set checkpoint timeout and default decision
    #[must_use]
    pub fn with_checkpoint_timeout(mut self, timeout: Duration, default: Decision) -> Self {
        self.checkpoint_timeout = timeout;
        self.checkpoint_default = default;
        self
    }

    /// Enable or disable plan learning
    #[must_use]
    pub fn with_learning(mut self, enabled: bool) -> Self {
        self.learn_plans = enabled;
        self
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if !matches!(
            self.checkpoint_default,
            Decision::Approved | Decision::Rejected
        ) {
            return Err(Error::Configuration(format!(
                "checkpoint default must be approved or rejected, got {}",
                self.checkpoint_default
            )));
        }
        if self.worker_timeout.is_zero() || self.plan_timeout.is_zero() {
            return Err(Error::Configuration(
                "worker and plan timeouts must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
