//! Session lifecycle states and failure kinds.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a session.
///
/// `Completed`, `Failed` and `Cancelled` are terminal; nothing leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Drafting the first plan
    Planning,
    /// Plan checkpoint raised, waiting for a decision
    AwaitingPlanApproval,
    /// Routing the next pending step to a worker
    Delegating,
    /// A step call is in flight
    WaitingForStep,
    /// The last step returned a result
    StepSucceeded,
    /// The last step failed
    StepFailed,
    /// Regenerating the remainder of the plan
    Replanning,
    /// Every step succeeded
    Completed,
    /// Gave up; see the session's failure kind
    Failed,
    /// Stopped by a cancellation request
    Cancelled,
}

impl SessionState {
    /// Whether the state is final
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::AwaitingPlanApproval => "awaiting_plan_approval",
            Self::Delegating => "delegating",
            Self::WaitingForStep => "waiting_for_step",
            Self::StepSucceeded => "step_succeeded",
            Self::StepFailed => "step_failed",
            Self::Replanning => "replanning",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a step or a session did not succeed.
///
/// Serialized with the session; these are outcomes, not engine errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// No worker is registered for the step's capability
    UnroutableStep {
        /// Capability tag that failed to resolve
        capability: String,
    },
    /// The worker (or plan generator) did not answer in time
    WorkerTimeout {
        /// Timeout that elapsed, in milliseconds
        after_ms: u64,
    },
    /// The worker (or plan generator) reported an error
    WorkerError {
        /// Error message
        message: String,
        /// Structured payload reported alongside the message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
    },
    /// A checkpoint expired and its default decision was applied
    CheckpointTimeout,
    /// Replanning was needed but the budget was spent
    ReplanBudgetExhausted {
        /// Replans performed before giving up
        replans: u32,
    },
    /// Cancelled on request
    Cancelled,
}

impl FailureKind {
    /// Failures that a plain retry of the same step may fix
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WorkerTimeout { .. } | Self::WorkerError { .. })
    }

    /// Short machine-friendly name
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::UnroutableStep { .. } => "unroutable_step",
            Self::WorkerTimeout { .. } => "worker_timeout",
            Self::WorkerError { .. } => "worker_error",
            Self::CheckpointTimeout => "checkpoint_timeout",
            Self::ReplanBudgetExhausted { .. } => "replan_budget_exhausted",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnroutableStep { capability } => {
                write!(f, "no worker registered for capability '{capability}'")
            }
            Self::WorkerTimeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            Self::WorkerError { message, .. } => write!(f, "worker error: {message}"),
            Self::CheckpointTimeout => write!(f, "checkpoint timed out"),
            Self::ReplanBudgetExhausted { replans } => {
                write!(f, "replan budget exhausted after {replans} replan(s)")
            }
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
