//! EventBus - broadcast of session progress
//!
//! Subscribers (the CLI, tests, future frontends) observe transitions without
//! touching the session store. Events carry ids and short summaries only;
//! full detail lives in the stored session.

use crate::checkpoint::{CheckpointSubject, Decision};
use crate::session::{FailureKind, SessionState};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events emitted while a session runs
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A session started or resumed
    SessionStarted {
        /// Session id
        session_id: Uuid,
        /// Goal text
        goal: String,
        /// Whether this run resumed a stored session
        resumed: bool,
    },
    /// The session moved to a new state
    StateChanged {
        /// Session id
        session_id: Uuid,
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
    },
    /// A checkpoint is waiting for a decision
    CheckpointRaised {
        /// Session id
        session_id: Uuid,
        /// Checkpoint id
        checkpoint_id: Uuid,
        /// What is being decided
        subject: CheckpointSubject,
        /// Proposed content
        proposed: String,
    },
    /// A checkpoint was decided
    CheckpointResolved {
        /// Session id
        session_id: Uuid,
        /// Checkpoint id
        checkpoint_id: Uuid,
        /// Decision applied
        decision: Decision,
        /// Whether the timeout default was applied
        timed_out: bool,
    },
    /// A step call was issued
    StepStarted {
        /// Session id
        session_id: Uuid,
        /// Step index
        index: usize,
        /// Capability tag
        capability: String,
        /// Attempt number, starting at 1
        attempt: u32,
    },
    /// A step call returned
    StepFinished {
        /// Session id
        session_id: Uuid,
        /// Step index
        index: usize,
        /// Whether it succeeded
        success: bool,
        /// Call duration in milliseconds
        duration_ms: u64,
    },
    /// Replanning began
    Replanning {
        /// Session id
        session_id: Uuid,
        /// Why the plan is being redone
        reason: String,
    },
    /// All steps succeeded
    SessionCompleted {
        /// Session id
        session_id: Uuid,
    },
    /// The session gave up
    SessionFailed {
        /// Session id
        session_id: Uuid,
        /// Why
        failure: FailureKind,
    },
    /// The session was cancelled
    SessionCancelled {
        /// Session id
        session_id: Uuid,
    },
}

impl SessionEvent {
    /// Session the event belongs to
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        match self {
            Self::SessionStarted { session_id, .. }
            | Self::StateChanged { session_id, .. }
            | Self::CheckpointRaised { session_id, .. }
            | Self::CheckpointResolved { session_id, .. }
            | Self::StepStarted { session_id, .. }
            | Self::StepFinished { session_id, .. }
            | Self::Replanning { session_id, .. }
            | Self::SessionCompleted { session_id }
            | Self::SessionFailed { session_id, .. }
            | Self::SessionCancelled { session_id } => *session_id,
        }
    }
}

/// Broadcast-based event bus.
///
/// Slow subscribers miss events (lagged) rather than blocking the engine.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all future events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Returns the number of subscribers reached.
    pub fn publish(&self, event: SessionEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let session_id = Uuid::new_v4();

        bus.publish(SessionEvent::StateChanged {
            session_id,
            from: SessionState::Planning,
            to: SessionState::AwaitingPlanApproval,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), session_id);
        match event {
            SessionEvent::StateChanged { to, .. } => {
                assert_eq!(to, SessionState::AwaitingPlanApproval);
            }
            _ => panic!("unexpected event type"),
        }
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        let delivered = bus.publish(SessionEvent::SessionCompleted {
            session_id: Uuid::new_v4(),
        });
        assert_eq!(delivered, 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::SessionFailed {
            session_id: Uuid::nil(),
            failure: FailureKind::ReplanBudgetExhausted { replans: 2 },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "session_failed");
        assert_eq!(json["failure"]["kind"], "replan_budget_exhausted");
    }
}
