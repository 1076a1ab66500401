//! Planning and plan approval

use crate::checkpoint::{Checkpoint, CheckpointSubject, Decision};
use crate::error::Result;
use crate::plan_text::{parse_plan_text, render_plan_text};
use crate::planner::PlanRequest;
use crate::session::{FailureKind, NoteLevel, Plan, SessionState, Step};
use helmsman_memory::{PlanMemory, ScoredRecord, StepTemplate};
use tracing::{debug, info, warn};

use super::machine::SessionMachine;

/// Result of the bounded generation loop
enum Generation {
    Drafted(Vec<StepTemplate>),
    Cancelled,
    Exhausted(FailureKind),
}

impl SessionMachine<'_> {
    /// `Planning` (fresh draft) and `Replanning` (keep the completed prefix)
    pub(super) async fn plan(&mut self, replanning: bool) -> Result<()> {
        let seed = if replanning {
            None
        } else {
            self.lookup_seed().await
        };
        let prefix: Vec<Step> = match (&self.session.plan, replanning) {
            (Some(plan), true) => plan.completed_prefix(),
            _ => Vec::new(),
        };

        let request = PlanRequest {
            goal: self.session.goal.clone(),
            context: self.session.context.clone(),
            prior_context: self.session.planning_notes.clone(),
            completed: prefix.iter().map(Step::template).collect(),
            seed: seed.as_ref().map(|hit| hit.record.steps.clone()),
            capabilities: self.orch.registry.tags(),
        };

        let drafts = match self.generate(&request).await {
            Generation::Drafted(drafts) => drafts,
            Generation::Cancelled => return Ok(()),
            Generation::Exhausted(failure) => {
                return self
                    .fail(failure, "plan generation failed after all attempts".to_string())
                    .await
            }
        };

        let mut plan = match &self.session.plan {
            Some(current) => current.revise(prefix, &drafts),
            None => Plan::new(&drafts),
        };
        if !replanning {
            plan = plan.with_seed(seed.map(|hit| hit.record.fingerprint.digest));
        }

        let (version, steps) = (plan.version, plan.steps.len());
        self.session.install_plan(plan);
        self.session.edit_rounds = 0;
        self.session.active_step = None;
        self.session.pending_checkpoint = self.plan_checkpoint();
        self.transition(
            SessionState::AwaitingPlanApproval,
            format!("plan v{version} drafted with {steps} step(s)"),
        )
        .await
    }

    async fn lookup_seed(&self) -> Option<ScoredRecord> {
        let key = PlanMemory::fingerprint(&self.session.goal, &self.session.context);
        match self.orch.memory.retrieve(&key).await {
            Ok(hit) => {
                if let Some(hit) = &hit {
                    info!(
                        session_id = %self.session.id,
                        record_id = %hit.record.id,
                        score = hit.score,
                        "Seeding plan from memory"
                    );
                }
                hit
            }
            Err(e) => {
                warn!(session_id = %self.session.id, error = %e, "Plan memory lookup failed");
                None
            }
        }
    }

    /// Call the generator with timeout and retries
    async fn generate(&mut self, request: &PlanRequest) -> Generation {
        let orch = self.orch;
        let attempts = orch.config.max_step_retries + 1;
        let timeout = orch.config.plan_timeout;
        let mut last_failure = None;

        for attempt in 1..=attempts {
            let call = orch.planner.generate_plan(request);
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Generation::Cancelled,
                r = tokio::time::timeout(timeout, call) => r,
            };

            let failure = match result {
                Ok(Ok(text)) => match parse_plan_text(&text) {
                    Ok(drafts) => {
                        debug!(session_id = %self.session.id, attempt, steps = drafts.len(), "Plan drafted");
                        return Generation::Drafted(drafts);
                    }
                    Err(e) => FailureKind::WorkerError {
                        message: e.to_string(),
                        payload: None,
                    },
                },
                Ok(Err(e)) => FailureKind::WorkerError {
                    message: e.message,
                    payload: e.payload,
                },
                Err(_) => FailureKind::WorkerTimeout {
                    after_ms: timeout.as_millis() as u64,
                },
            };

            warn!(
                session_id = %self.session.id,
                attempt,
                attempts,
                failure = %failure,
                "Plan generation attempt failed"
            );
            self.session.note_failure(
                format!("plan generation attempt {attempt}/{attempts} failed"),
                failure.clone(),
            );
            last_failure = Some(failure);
        }

        Generation::Exhausted(last_failure.unwrap_or(FailureKind::WorkerError {
            message: "plan generator was never called".to_string(),
            payload: None,
        }))
    }

    /// Checkpoint covering the not-yet-completed part of the active plan
    pub(super) fn plan_checkpoint(&self) -> Option<Checkpoint> {
        let plan = self.session.plan.as_ref()?;
        let checkpoint = Checkpoint::new(
            self.session.id,
            CheckpointSubject::Plan {
                plan_id: plan.id,
                version: plan.version,
            },
            render_plan_text(&plan.remaining_templates()),
        );
        Some(match (plan.previous, self.session.planning_notes.last()) {
            (Some(_), Some(note)) => checkpoint.with_reason(format!("revised after: {note}")),
            _ => checkpoint,
        })
    }

    /// `AwaitingPlanApproval`
    pub(super) async fn await_plan_approval(&mut self) -> Result<()> {
        let checkpoint = match self.session.pending_checkpoint.clone() {
            Some(checkpoint) if checkpoint.is_pending() => checkpoint,
            _ => match self.plan_checkpoint() {
                Some(checkpoint) => checkpoint,
                None => {
                    return self
                        .transition(SessionState::Planning, "no plan to approve, drafting one")
                        .await
                }
            },
        };

        let outcome = self.raise_checkpoint(checkpoint).await?;
        if outcome.cancelled() || self.cancel.is_cancelled() {
            return Ok(());
        }

        let version = self.session.plan.as_ref().map_or(0, |p| p.version);
        match outcome.decision() {
            Decision::Approved => {
                self.transition(SessionState::Delegating, format!("plan v{version} approved"))
                    .await
            }
            Decision::Edited => {
                let text = outcome.edited_content().unwrap_or_default().to_string();
                self.apply_plan_edit(&text).await
            }
            Decision::Rejected | Decision::Pending => {
                let reason = if outcome.timed_out() {
                    format!("plan v{version} was not approved in time")
                } else {
                    format!("plan v{version} was rejected")
                };
                let has_progress = self
                    .session
                    .plan
                    .as_ref()
                    .is_some_and(|p| !p.completed_prefix().is_empty());
                let target = if has_progress {
                    SessionState::Replanning
                } else {
                    SessionState::Planning
                };
                self.request_replan(reason, target).await
            }
        }
    }

    /// Replace the pending part of the plan with edited text
    async fn apply_plan_edit(&mut self, text: &str) -> Result<()> {
        self.session.edit_rounds += 1;
        let rounds = self.session.edit_rounds;

        if let Some(current) = self.session.plan.clone() {
            match parse_plan_text(text) {
                Ok(drafts) => {
                    let revised = current.revise(current.completed_prefix(), &drafts);
                    self.session.install_plan(revised);
                }
                Err(e) => {
                    warn!(session_id = %self.session.id, error = %e, "Edited plan is unreadable");
                    self.session
                        .note(NoteLevel::Warning, format!("edited plan ignored: {e}"));
                }
            }
        }

        let max = self.orch.config.max_edit_rounds;
        if rounds > max {
            self.session.note(
                NoteLevel::Warning,
                format!("edit round {rounds} exceeds the limit of {max}, accepting the edit"),
            );
            return self
                .transition(SessionState::Delegating, "edited plan auto-accepted")
                .await;
        }

        self.session.pending_checkpoint = self.plan_checkpoint();
        self.transition(
            SessionState::AwaitingPlanApproval,
            format!("plan edited (round {rounds}/{max})"),
        )
        .await
    }
}
