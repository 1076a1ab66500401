//! Session - durable record of one goal being worked on
//!
//! A [`Session`] is the only thing the orchestrator persists about a run.
//! It is saved after every state transition, so a process restart can pick
//! the session back up from its last stored state.
//!
//! # Module Structure
//!
//! - `state`: lifecycle states and failure kinds
//! - `plan`: plans, steps and worker bindings

mod plan;
mod state;


pub use plan::{Plan, Step, StepOutput, StepStatus, WorkerBinding};
pub use state::{FailureKind, SessionState};

use crate::checkpoint::Checkpoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Store key prefix for sessions
pub const SESSION_KEY_PREFIX: &str = "session:";

/// Store key for a session id
#[must_use]
pub fn session_key(id: Uuid) -> String {
    format!("{SESSION_KEY_PREFIX}{id}")
}

/// Severity of a session log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteLevel {
    /// Normal progress
    Info,
    /// Something was recovered from or defaulted
    Warning,
}

/// One line of the session's message log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionNote {
    /// When it was written
    pub at: DateTime<Utc>,
    /// State the session was in (after the transition, for transitions)
    pub state: SessionState,
    /// Severity
    pub level: NoteLevel,
    /// Message
    pub text: String,
    /// Failure attached to this entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
}

/// Durable state of one goal-directed run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session id
    pub id: Uuid,
    /// Goal text
    pub goal: String,
    /// Context fields supplied with the goal
    #[serde(default)]
    pub context: BTreeMap<String, String>,
    /// Current lifecycle state
    pub state: SessionState,
    /// Active plan version
    #[serde(default)]
    pub plan: Option<Plan>,
    /// Superseded plan versions, oldest first
    #[serde(default)]
    pub plan_history: Vec<Plan>,
    /// Failure reasons and rejections fed back into planning
    #[serde(default)]
    pub planning_notes: Vec<String>,
    /// Replans performed (including plan rejections)
    #[serde(default)]
    pub replan_count: u32,
    /// Edit rounds on the current plan approval
    #[serde(default)]
    pub edit_rounds: u32,
    /// Step currently being delegated, awaited or reviewed
    #[serde(default)]
    pub active_step: Option<usize>,
    /// Why the session ended in `Failed` or `Cancelled`
    #[serde(default)]
    pub failure: Option<FailureKind>,
    /// Checkpoint currently waiting for a decision
    #[serde(default)]
    pub pending_checkpoint: Option<Checkpoint>,
    /// Resolved checkpoints, oldest first
    #[serde(default)]
    pub checkpoints: Vec<Checkpoint>,
    /// Message log
    #[serde(default)]
    pub log: Vec<SessionNote>,
    /// Last snapshot of each worker's state, by capability
    #[serde(default)]
    pub worker_states: BTreeMap<String, serde_json::Value>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a session in `Planning`
    #[must_use]
    pub fn new(goal: impl Into<String>, context: BTreeMap<String, String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            goal: goal.into(),
            context,
            state: SessionState::Planning,
            plan: None,
            plan_history: Vec::new(),
            planning_notes: Vec::new(),
            replan_count: 0,
            edit_rounds: 0,
            active_step: None,
            failure: None,
            pending_checkpoint: None,
            checkpoints: Vec::new(),
            log: Vec::new(),
            worker_states: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Store key for this session
    #[must_use]
    pub fn key(&self) -> String {
        session_key(self.id)
    }

    /// Replace the active plan, moving the old one into history
    pub fn install_plan(&mut self, plan: Plan) {
        if let Some(old) = self.plan.replace(plan) {
            self.plan_history.push(old);
        }
        self.touch();
    }

    /// Active step, if any
    #[must_use]
    pub fn active(&self) -> Option<&Step> {
        let index = self.active_step?;
        self.plan.as_ref()?.steps.get(index)
    }

    /// Mutable access to the active step
    pub fn active_mut(&mut self) -> Option<&mut Step> {
        let index = self.active_step?;
        self.plan.as_mut()?.steps.get_mut(index)
    }

    /// Number of steps currently in flight (never more than one)
    #[must_use]
    pub fn in_progress_count(&self) -> usize {
        self.plan
            .as_ref()
            .map(|p| {
                p.steps
                    .iter()
                    .filter(|s| s.status == StepStatus::InProgress)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Total retries across the active plan
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.plan
            .as_ref()
            .map(|p| p.steps.iter().map(Step::retries).sum())
            .unwrap_or(0)
    }

    /// Append to the message log
    pub fn note(&mut self, level: NoteLevel, text: impl Into<String>) {
        self.push_note(level, text.into(), None);
    }

    /// Append a log entry that carries a failure
    pub fn note_failure(&mut self, text: impl Into<String>, failure: FailureKind) {
        self.push_note(NoteLevel::Warning, text.into(), Some(failure));
    }

    fn push_note(&mut self, level: NoteLevel, text: String, failure: Option<FailureKind>) {
        self.log.push(SessionNote {
            at: Utc::now(),
            state: self.state,
            level,
            text,
            failure,
        });
        self.touch();
    }

    /// Bump `updated_at`
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// One-line overview for listings
    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let (steps_done, steps_total) = self
            .plan
            .as_ref()
            .map(|p| {
                (
                    p.steps.iter().filter(|s| s.is_done()).count(),
                    p.steps.len(),
                )
            })
            .unwrap_or((0, 0));
        SessionSummary {
            id: self.id,
            goal: self.goal.clone(),
            state: self.state,
            steps_done,
            steps_total,
            replan_count: self.replan_count,
            updated_at: self.updated_at,
        }
    }
}

/// Listing row for a stored session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session id
    pub id: Uuid,
    /// Goal text
    pub goal: String,
    /// Current state
    pub state: SessionState,
    /// Steps done in the active plan
    pub steps_done: usize,
    /// Steps in the active plan
    pub steps_total: usize,
    /// Replans performed
    pub replan_count: u32,
    /// Last update
    pub updated_at: DateTime<Utc>,
}
