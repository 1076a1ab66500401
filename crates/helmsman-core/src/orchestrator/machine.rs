//! Per-session state machine
//!
//! `SessionMachine::run` loops over the session's state until it is terminal.
//! Every handler either performs exactly one transition or returns early
//! because cancellation was observed; the loop head then moves the session
//! to `Cancelled`. Each transition is persisted before the next handler runs.

use crate::checkpoint::{
    Checkpoint, CheckpointGate, CheckpointOutcome, Decision, Resolution,
};
use crate::error::Result;
use crate::event_bus::SessionEvent;
use crate::registry::WorkerHandle;
use crate::session::{FailureKind, NoteLevel, Session, SessionState, StepStatus};
use crate::store;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::core::Orchestrator;
use super::types::SessionOutcome;

/// Drives one session for the lifetime of a `drive` call
pub(crate) struct SessionMachine<'a> {
    pub(super) orch: &'a Orchestrator,
    pub(super) session: Session,
    pub(super) gate: Arc<CheckpointGate>,
    pub(super) cancel: CancellationToken,
    /// Handle for the step marked `InProgress`; lost on restart
    pub(super) in_flight: Option<WorkerHandle>,
    pub(super) resumed: bool,
    /// Capabilities whose stored worker state was already restored
    pub(super) restored: HashSet<String>,
    pub(super) learned_record: Option<Uuid>,
    started: Instant,
}

impl<'a> SessionMachine<'a> {
    pub(crate) fn new(
        orch: &'a Orchestrator,
        session: Session,
        gate: Arc<CheckpointGate>,
        cancel: CancellationToken,
        resumed: bool,
    ) -> Self {
        Self {
            orch,
            session,
            gate,
            cancel,
            in_flight: None,
            resumed,
            restored: HashSet::new(),
            learned_record: None,
            started: Instant::now(),
        }
    }

    pub(crate) async fn run(mut self) -> Result<SessionOutcome> {
        info!(
            session_id = %self.session.id,
            state = %self.session.state,
            resumed = self.resumed,
            "Driving session"
        );
        self.orch.emit(SessionEvent::SessionStarted {
            session_id: self.session.id,
            goal: self.session.goal.clone(),
            resumed: self.resumed,
        });

        while !self.session.state.is_terminal() {
            if self.cancel.is_cancelled() {
                self.enter_cancelled().await?;
                break;
            }
            match self.session.state {
                SessionState::Planning => self.plan(false).await?,
                SessionState::Replanning => self.plan(true).await?,
                SessionState::AwaitingPlanApproval => self.await_plan_approval().await?,
                SessionState::Delegating => self.delegate().await?,
                SessionState::WaitingForStep => self.wait_for_step().await?,
                SessionState::StepSucceeded => self.review_step().await?,
                SessionState::StepFailed => self.handle_step_failure().await?,
                SessionState::Completed | SessionState::Failed | SessionState::Cancelled => break,
            }
        }

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            session_id = %self.session.id,
            state = %self.session.state,
            replans = self.session.replan_count,
            duration_ms,
            "Session stopped"
        );
        Ok(SessionOutcome {
            session: self.session,
            learned_record: self.learned_record,
            duration_ms,
        })
    }

    pub(super) async fn persist(&self) -> Result<()> {
        store::save_session(self.orch.store.as_ref(), &self.session).await
    }

    /// Move to `to` and persist. Once cancellation is requested only
    /// `Cancelled` is accepted; other transitions are dropped.
    pub(super) async fn transition(&mut self, to: SessionState, note: impl Into<String>) -> Result<()> {
        if self.cancel.is_cancelled() && to != SessionState::Cancelled {
            debug!(session_id = %self.session.id, skipped = %to, "Cancellation pending, transition dropped");
            return Ok(());
        }
        let from = self.session.state;
        let note = note.into();
        self.session.state = to;
        self.session.note(NoteLevel::Info, note.clone());
        self.persist().await?;

        info!(session_id = %self.session.id, %from, %to, note = %note, "Session transition");
        self.orch.emit(SessionEvent::StateChanged {
            session_id: self.session.id,
            from,
            to,
        });
        Ok(())
    }

    /// Raise a checkpoint through the session's gate and record the result
    pub(super) async fn raise_checkpoint(&mut self, checkpoint: Checkpoint) -> Result<CheckpointOutcome> {
        self.session.pending_checkpoint = Some(checkpoint.clone());
        self.persist().await?;
        self.orch.emit(SessionEvent::CheckpointRaised {
            session_id: self.session.id,
            checkpoint_id: checkpoint.id,
            subject: checkpoint.subject.clone(),
            proposed: checkpoint.proposed.clone(),
        });

        let outcome = self.gate.raise(checkpoint).await?;

        self.session.pending_checkpoint = None;
        self.session.checkpoints.push(outcome.checkpoint.clone());
        if outcome.timed_out() {
            self.session.note_failure(
                format!(
                    "checkpoint {} timed out, applied default '{}'",
                    outcome.checkpoint.id,
                    outcome.decision()
                ),
                FailureKind::CheckpointTimeout,
            );
        }
        self.orch.emit(SessionEvent::CheckpointResolved {
            session_id: self.session.id,
            checkpoint_id: outcome.checkpoint.id,
            decision: outcome.decision(),
            timed_out: outcome.timed_out(),
        });
        Ok(outcome)
    }

    /// Spend one replan, or fail once the budget is gone
    pub(super) async fn request_replan(&mut self, reason: String, target: SessionState) -> Result<()> {
        self.session.planning_notes.push(reason.clone());
        let max = self.orch.config.max_replans;
        if self.session.replan_count >= max {
            let replans = self.session.replan_count;
            return self
                .fail(
                    FailureKind::ReplanBudgetExhausted { replans },
                    format!("replan budget exhausted: {reason}"),
                )
                .await;
        }

        self.session.replan_count += 1;
        let count = self.session.replan_count;
        self.orch.emit(SessionEvent::Replanning {
            session_id: self.session.id,
            reason: reason.clone(),
        });
        self.transition(target, format!("replanning ({count}/{max}): {reason}"))
            .await
    }

    pub(super) async fn fail(&mut self, failure: FailureKind, note: String) -> Result<()> {
        warn!(session_id = %self.session.id, failure = %failure, "Session failing");
        self.session.failure = Some(failure.clone());
        self.session.note_failure(note.clone(), failure.clone());
        self.transition(SessionState::Failed, note).await?;
        if self.session.state == SessionState::Failed {
            self.orch.emit(SessionEvent::SessionFailed {
                session_id: self.session.id,
                failure,
            });
        }
        Ok(())
    }

    async fn enter_cancelled(&mut self) -> Result<()> {
        if let Some(plan) = self.session.plan.as_mut() {
            for step in plan
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::InProgress)
            {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }
        self.in_flight = None;
        if let Some(mut checkpoint) = self.session.pending_checkpoint.take() {
            checkpoint.resolve(Decision::Rejected, None, Resolution::Cancellation);
            self.session.checkpoints.push(checkpoint);
        }
        self.session.failure = Some(FailureKind::Cancelled);
        self.transition(SessionState::Cancelled, "cancelled on request")
            .await?;
        self.orch.emit(SessionEvent::SessionCancelled {
            session_id: self.session.id,
        });
        Ok(())
    }
}
