//! Checkpoint data types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Human decision on a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Not decided yet
    Pending,
    /// Accepted as proposed
    Approved,
    /// Accepted with replacement content
    Edited,
    /// Refused
    Rejected,
}

impl Decision {
    /// Returns the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Edited => "edited",
            Self::Rejected => "rejected",
        }
    }

    /// Parse from a user-supplied string
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "yes" | "y" => Some(Self::Approved),
            "edit" | "edited" => Some(Self::Edited),
            "reject" | "rejected" | "no" | "n" => Some(Self::Rejected),
            "pending" => Some(Self::Pending),
            _ => None,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a checkpoint asks about
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CheckpointSubject {
    /// Approval of a whole plan version
    Plan {
        /// Plan id
        plan_id: Uuid,
        /// Plan version
        version: u32,
    },
    /// Review of a single step's result
    Step {
        /// Plan id
        plan_id: Uuid,
        /// Step index
        index: usize,
    },
}

/// How a checkpoint got its decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// A human submitted it
    Human,
    /// The timeout elapsed and the default decision was applied
    Timeout,
    /// The session was cancelled while waiting
    Cancellation,
}

/// A suspension point that waits for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique checkpoint id
    pub id: Uuid,
    /// Owning session
    pub session_id: Uuid,
    /// What is being decided
    pub subject: CheckpointSubject,
    /// Content proposed for approval
    pub proposed: String,
    /// Why review was requested
    #[serde(default)]
    pub reason: Option<String>,
    /// Current decision
    pub decision: Decision,
    /// Replacement content for `Edited`
    #[serde(default)]
    pub edited_content: Option<String>,
    /// How the decision was reached
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// When it was raised
    pub created_at: DateTime<Utc>,
    /// When it was resolved
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Create a pending checkpoint
    #[must_use]
    pub fn new(session_id: Uuid, subject: CheckpointSubject, proposed: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            subject,
            proposed: proposed.into(),
            reason: None,
            decision: Decision::Pending,
            edited_content: None,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Attach the review reason
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Check if the checkpoint is still waiting
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.decision == Decision::Pending
    }

    /// Record the decision. No-op once resolved.
    pub fn resolve(&mut self, decision: Decision, edited: Option<String>, resolution: Resolution) {
        if !self.is_pending() {
            return;
        }
        self.decision = decision;
        self.edited_content = edited;
        self.resolution = Some(resolution);
        self.resolved_at = Some(Utc::now());
    }
}

/// Error from checkpoint resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// No pending checkpoint with this id
    NotFound,
    /// The checkpoint was already decided
    AlreadyResolved,
    /// `Pending` submitted, or `Edited` without content
    InvalidDecision,
    /// The session already has a pending checkpoint
    AlreadyPending,
}

impl std::fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound => write!(f, "checkpoint not found"),
            Self::AlreadyResolved => write!(f, "checkpoint already resolved"),
            Self::InvalidDecision => write!(f, "invalid decision for checkpoint"),
            Self::AlreadyPending => write!(f, "session already has a pending checkpoint"),
        }
    }
}

impl std::error::Error for CheckpointError {}
