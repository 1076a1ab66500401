//! Plans and their steps.
//!
//! A plan version is immutable once execution starts: replanning and edits
//! always produce a new [`Plan`] whose `previous` points at the version it
//! replaces. Step status, attempts and results are the only fields that move
//! while a plan runs.

use super::state::FailureKind;
use chrono::{DateTime, Utc};
use helmsman_memory::StepTemplate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of a single step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not started yet (or reset after an interrupted call)
    Pending,
    /// A call is in flight
    InProgress,
    /// Finished with a result
    Succeeded,
    /// Finished without a usable result
    Failed,
    /// Dropped from execution
    Skipped,
}

impl StepStatus {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result returned by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    /// Primary textual result
    pub text: String,
    /// Optional structured payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl StepOutput {
    /// Plain text output
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            data: None,
        }
    }

    /// Attach a structured payload
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Which worker handled (or is handling) a step
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerBinding {
    /// Capability tag the step was routed by
    pub capability: String,
    /// Identity of the registered handle
    pub identity: String,
}

/// One unit of delegated work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Zero-based position in the plan
    pub index: usize,
    /// Capability tag used for routing
    pub capability: String,
    /// Instruction sent to the worker
    pub instruction: String,
    /// Current status
    pub status: StepStatus,
    /// Worker result, once succeeded
    #[serde(default)]
    pub result: Option<StepOutput>,
    /// Calls issued for this step so far
    #[serde(default)]
    pub attempts: u32,
    /// Most recent failure, if any
    #[serde(default)]
    pub last_failure: Option<FailureKind>,
    /// Worker bound on the latest attempt
    #[serde(default)]
    pub worker: Option<WorkerBinding>,
    /// When the latest attempt started
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// When the step last finished
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    /// Create a pending step
    #[must_use]
    pub fn new(index: usize, capability: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            index,
            capability: capability.into(),
            instruction: instruction.into(),
            status: StepStatus::Pending,
            result: None,
            attempts: 0,
            last_failure: None,
            worker: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Build a pending step from a template
    #[must_use]
    pub fn from_template(index: usize, template: &StepTemplate) -> Self {
        Self::new(index, &template.capability, &template.instruction)
    }

    /// Capability and instruction without run-time state
    #[must_use]
    pub fn template(&self) -> StepTemplate {
        StepTemplate::new(&self.capability, &self.instruction)
    }

    /// Retries performed (attempts beyond the first)
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    /// Whether the step has reached a final status
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.status, StepStatus::Succeeded | StepStatus::Skipped)
    }
}

/// An ordered list of steps toward the session goal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Unique plan id
    pub id: Uuid,
    /// Version number, starting at 1
    pub version: u32,
    /// Plan this version replaced
    #[serde(default)]
    pub previous: Option<Uuid>,
    /// Fingerprint digest of the learned record that seeded this plan
    #[serde(default)]
    pub seeded_from: Option<String>,
    /// Steps in execution order
    pub steps: Vec<Step>,
    /// When the version was created
    pub created_at: DateTime<Utc>,
}

impl Plan {
    /// First version of a plan
    #[must_use]
    pub fn new(templates: &[StepTemplate]) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: 1,
            previous: None,
            seeded_from: None,
            steps: templates
                .iter()
                .enumerate()
                .map(|(i, t)| Step::from_template(i, t))
                .collect(),
            created_at: Utc::now(),
        }
    }

    /// New version that keeps `prefix` as-is and appends fresh steps.
    #[must_use]
    pub fn revise(&self, prefix: Vec<Step>, suffix: &[StepTemplate]) -> Self {
        let offset = prefix.len();
        let mut steps = prefix;
        steps.extend(
            suffix
                .iter()
                .enumerate()
                .map(|(i, t)| Step::from_template(offset + i, t)),
        );
        Self {
            id: Uuid::new_v4(),
            version: self.version + 1,
            previous: Some(self.id),
            seeded_from: self.seeded_from.clone(),
            steps,
            created_at: Utc::now(),
        }
    }

    /// Record the learned plan this version was seeded from
    #[must_use]
    pub fn with_seed(mut self, digest: Option<String>) -> Self {
        self.seeded_from = digest;
        self
    }

    /// Leading run of succeeded steps
    #[must_use]
    pub fn completed_prefix(&self) -> Vec<Step> {
        self.steps
            .iter()
            .take_while(|s| s.status == StepStatus::Succeeded)
            .cloned()
            .collect()
    }

    /// Steps after the completed prefix, as templates
    #[must_use]
    pub fn remaining_templates(&self) -> Vec<StepTemplate> {
        self.steps
            .iter()
            .skip_while(|s| s.status == StepStatus::Succeeded)
            .map(Step::template)
            .collect()
    }

    /// Index of the first step still pending
    #[must_use]
    pub fn next_pending(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::Pending)
    }

    /// Index of the step currently in flight
    #[must_use]
    pub fn in_progress(&self) -> Option<usize> {
        self.steps
            .iter()
            .position(|s| s.status == StepStatus::InProgress)
    }

    /// Whether every step is done
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(Step::is_done)
    }

    /// All steps as templates
    #[must_use]
    pub fn templates(&self) -> Vec<StepTemplate> {
        self.steps.iter().map(Step::template).collect()
    }
}
