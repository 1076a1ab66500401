//! Core data types for plan memory.

use crate::fingerprint::Fingerprint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One step of a remembered plan, stripped of run-time status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    /// Capability tag the step was routed to
    pub capability: String,
    /// Instruction text sent to the worker
    pub instruction: String,
}

impl StepTemplate {
    /// Create a new step template
    #[must_use]
    pub fn new(capability: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            instruction: instruction.into(),
        }
    }
}

/// How cleanly the remembered plan ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeQuality {
    /// Every step succeeded on its first attempt with no replanning
    Clean,
    /// The run needed retries or replanning before it completed
    Recovered,
}

impl OutcomeQuality {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Recovered => "recovered",
        }
    }

    /// Parse from string.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "clean" => Self::Clean,
            _ => Self::Recovered,
        }
    }
}

impl std::fmt::Display for OutcomeQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A successful plan indexed for reuse. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPlanRecord {
    /// Unique record ID
    pub id: Uuid,
    /// Fingerprint the record is bucketed under
    pub fingerprint: Fingerprint,
    /// Goal text of the session that produced the plan
    pub goal: String,
    /// The successful step sequence
    pub steps: Vec<StepTemplate>,
    /// Outcome quality marker
    pub outcome: OutcomeQuality,
    /// When the record was written
    pub created_at: DateTime<Utc>,
    /// Store-assigned insertion order, used to break timestamp ties
    #[serde(default)]
    pub sequence: i64,
}

impl LearnedPlanRecord {
    /// Create a new record (sequence is assigned by the store on append)
    #[must_use]
    pub fn new(
        fingerprint: Fingerprint,
        goal: impl Into<String>,
        steps: Vec<StepTemplate>,
        outcome: OutcomeQuality,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            goal: goal.into(),
            steps,
            outcome,
            created_at: Utc::now(),
            sequence: 0,
        }
    }
}

/// A record returned by similarity retrieval.
#[derive(Debug, Clone)]
pub struct ScoredRecord {
    /// The matching record
    pub record: LearnedPlanRecord,
    /// Fingerprint similarity to the query (0.0 – 1.0)
    pub score: f32,
}
