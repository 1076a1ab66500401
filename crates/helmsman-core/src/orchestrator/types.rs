//! Orchestrator result types

use crate::session::{FailureKind, Session, SessionState};
use uuid::Uuid;

/// Final (or interrupted) state of a driven session
#[derive(Debug, Clone)]
pub struct SessionOutcome {
    /// The session as last persisted
    pub session: Session,
    /// Learned plan record written on completion
    pub learned_record: Option<Uuid>,
    /// Wall time of this drive, in milliseconds
    pub duration_ms: u64,
}

impl SessionOutcome {
    /// Session id
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session.id
    }

    /// Final state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Failure kind for `Failed` / `Cancelled`
    #[must_use]
    pub fn failure(&self) -> Option<&FailureKind> {
        self.session.failure.as_ref()
    }

    /// Whether every step succeeded
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.session.state == SessionState::Completed
    }
}
