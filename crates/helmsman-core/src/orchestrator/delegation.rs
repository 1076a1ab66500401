//! Step delegation, waiting, review and failure handling

use crate::checkpoint::{Checkpoint, CheckpointSubject, Decision};
use crate::error::Result;
use crate::event_bus::SessionEvent;
use crate::registry::WorkerHandle;
use crate::session::{FailureKind, NoteLevel, Plan, SessionState, Step, StepOutput, StepStatus};
use chrono::Utc;
use helmsman_memory::{OutcomeQuality, PlanMemory};
use std::time::Instant;
use tracing::{debug, info, warn};

use super::machine::SessionMachine;

impl SessionMachine<'_> {
    /// `Delegating`: route the next pending step to its worker
    pub(super) async fn delegate(&mut self) -> Result<()> {
        let Some(plan) = self.session.plan.as_ref() else {
            return self
                .transition(SessionState::Planning, "no active plan, drafting one")
                .await;
        };
        let Some(index) = plan.next_pending() else {
            if plan.is_finished() {
                return self.complete().await;
            }
            return self
                .request_replan("plan has no runnable step left".to_string(), SessionState::Replanning)
                .await;
        };

        let capability = plan.steps[index].capability.clone();
        let number = index + 1;
        self.session.active_step = Some(index);

        let Some(handle) = self.orch.registry.resolve(&capability) else {
            let failure = FailureKind::UnroutableStep {
                capability: capability.clone(),
            };
            warn!(session_id = %self.session.id, step = number, %capability, "No worker for capability");
            if let Some(step) = self.session.active_mut() {
                step.status = StepStatus::Failed;
                step.last_failure = Some(failure.clone());
                step.finished_at = Some(Utc::now());
            }
            self.session
                .note_failure(format!("step {number} is unroutable"), failure);
            return self
                .transition(SessionState::StepFailed, format!("step {number} has no worker"))
                .await;
        };

        self.restore_worker_state(&handle).await;
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let binding = handle.binding();
        let attempt = match self.session.active_mut() {
            Some(step) => {
                step.status = StepStatus::InProgress;
                step.attempts += 1;
                step.worker = Some(binding.clone());
                step.started_at = Some(Utc::now());
                step.finished_at = None;
                step.attempts
            }
            None => 1,
        };
        self.in_flight = Some(handle);

        self.orch.emit(SessionEvent::StepStarted {
            session_id: self.session.id,
            index,
            capability: capability.clone(),
            attempt,
        });
        self.transition(
            SessionState::WaitingForStep,
            format!(
                "step {number} delegated to {} (attempt {attempt})",
                binding.identity
            ),
        )
        .await
    }

    /// Apply stored worker state once per capability after a resume
    async fn restore_worker_state(&mut self, handle: &WorkerHandle) {
        let capability = handle.capability().to_string();
        if !self.resumed || !self.restored.insert(capability.clone()) {
            return;
        }
        let Some(state) = self.session.worker_states.get(&capability).cloned() else {
            return;
        };
        let timeout = self.orch.config.worker_timeout;
        match tokio::time::timeout(timeout, handle.worker().restore_state(state)).await {
            Ok(Ok(())) => debug!(session_id = %self.session.id, %capability, "Worker state restored"),
            Ok(Err(e)) => {
                warn!(session_id = %self.session.id, %capability, error = %e, "Worker state restore failed");
                self.session.note(
                    NoteLevel::Warning,
                    format!("could not restore '{capability}' worker state: {e}"),
                );
            }
            Err(_) => {
                warn!(session_id = %self.session.id, %capability, "Worker state restore timed out");
            }
        }
    }

    /// `WaitingForStep`: await the in-flight call
    pub(super) async fn wait_for_step(&mut self) -> Result<()> {
        let Some(index) = self.session.plan.as_ref().and_then(Plan::in_progress) else {
            return self
                .transition(SessionState::Delegating, "no step in flight, re-delegating")
                .await;
        };
        self.session.active_step = Some(index);
        let number = index + 1;

        let Some(handle) = self.in_flight.take() else {
            // The call died with the previous process; issue it again without
            // charging an extra attempt.
            if let Some(step) = self.session.active_mut() {
                step.status = StepStatus::Pending;
                step.attempts = step.attempts.saturating_sub(1);
                step.started_at = None;
            }
            self.session.note(
                NoteLevel::Warning,
                format!("step {number} was in flight when the session stopped"),
            );
            return self
                .transition(SessionState::Delegating, format!("re-delegating step {number}"))
                .await;
        };

        let instruction = self.session.plan.as_ref().map_or_else(String::new, |p| {
            p.steps[index].instruction.clone()
        });
        let timeout = self.orch.config.worker_timeout;
        let started = Instant::now();

        let call = handle.worker().invoke(&instruction, self.cancel.child_token());
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Ok(()),
            r = tokio::time::timeout(timeout, call) => r,
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(output)) => self.record_success(&handle, output, duration_ms).await,
            Ok(Err(e)) => {
                let failure = FailureKind::WorkerError {
                    message: e.message,
                    payload: e.payload,
                };
                self.record_failure(failure, duration_ms).await
            }
            Err(_) => {
                let failure = FailureKind::WorkerTimeout {
                    after_ms: timeout.as_millis() as u64,
                };
                self.record_failure(failure, duration_ms).await
            }
        }
    }

    async fn record_success(
        &mut self,
        handle: &WorkerHandle,
        output: StepOutput,
        duration_ms: u64,
    ) -> Result<()> {
        let timeout = self.orch.config.worker_timeout;
        match tokio::time::timeout(timeout, handle.worker().snapshot_state()).await {
            Ok(Ok(serde_json::Value::Null)) => {}
            Ok(Ok(state)) => {
                self.session
                    .worker_states
                    .insert(handle.capability().to_string(), state);
            }
            Ok(Err(e)) => {
                warn!(session_id = %self.session.id, capability = handle.capability(), error = %e, "Worker snapshot failed");
            }
            Err(_) => {
                warn!(session_id = %self.session.id, capability = handle.capability(), "Worker snapshot timed out");
            }
        }

        let mut number = 0;
        if let Some(step) = self.session.active_mut() {
            step.status = StepStatus::Succeeded;
            step.result = Some(output);
            step.last_failure = None;
            step.finished_at = Some(Utc::now());
            number = step.index + 1;
        }
        self.orch.emit(SessionEvent::StepFinished {
            session_id: self.session.id,
            index: number.saturating_sub(1),
            success: true,
            duration_ms,
        });
        self.transition(
            SessionState::StepSucceeded,
            format!("step {number} succeeded in {duration_ms}ms"),
        )
        .await
    }

    async fn record_failure(&mut self, failure: FailureKind, duration_ms: u64) -> Result<()> {
        let mut number = 0;
        if let Some(step) = self.session.active_mut() {
            step.status = StepStatus::Failed;
            step.last_failure = Some(failure.clone());
            step.finished_at = Some(Utc::now());
            number = step.index + 1;
        }
        warn!(session_id = %self.session.id, step = number, failure = %failure, "Step failed");
        self.session
            .note_failure(format!("step {number} failed: {failure}"), failure);
        self.orch.emit(SessionEvent::StepFinished {
            session_id: self.session.id,
            index: number.saturating_sub(1),
            success: false,
            duration_ms,
        });
        self.transition(SessionState::StepFailed, format!("step {number} failed"))
            .await
    }

    /// `StepSucceeded`: optional human review, then move on
    pub(super) async fn review_step(&mut self) -> Result<()> {
        let Some(step) = self.session.active().cloned() else {
            return self.advance().await;
        };
        if step.status != StepStatus::Succeeded {
            return self.advance().await;
        }
        let number = step.index + 1;
        let output = step
            .result
            .clone()
            .unwrap_or_else(|| StepOutput::text(String::new()));

        if let Some(reason) = self.orch.policy.review_reason(&step, &output) {
            let plan_id = self.session.plan.as_ref().map(|p| p.id).unwrap_or_default();
            let checkpoint = Checkpoint::new(
                self.session.id,
                CheckpointSubject::Step {
                    plan_id,
                    index: step.index,
                },
                output.text.clone(),
            )
            .with_reason(reason);

            let outcome = self.raise_checkpoint(checkpoint).await?;
            if outcome.cancelled() || self.cancel.is_cancelled() {
                return Ok(());
            }

            match outcome.decision() {
                Decision::Approved => {}
                Decision::Edited => {
                    let edited = outcome.edited_content().unwrap_or_default().to_string();
                    if let Some(result) = self.session.active_mut().and_then(|s| s.result.as_mut()) {
                        result.text = edited;
                    }
                    self.session
                        .note(NoteLevel::Info, format!("step {number} result edited by reviewer"));
                }
                Decision::Rejected | Decision::Pending => {
                    if let Some(active) = self.session.active_mut() {
                        active.status = StepStatus::Failed;
                        active.finished_at = Some(Utc::now());
                    }
                    let reason = if outcome.timed_out() {
                        format!("result of step {number} was not reviewed in time")
                    } else {
                        format!("result of step {number} was rejected by the reviewer")
                    };
                    return self.request_replan(reason, SessionState::Replanning).await;
                }
            }
        }

        self.advance().await
    }

    /// Next step, or completion when none is left
    async fn advance(&mut self) -> Result<()> {
        let (pending, finished) = match self.session.plan.as_ref() {
            Some(plan) => (plan.next_pending().is_some(), plan.is_finished()),
            None => (false, false),
        };
        let done = self.session.active().map_or(0, |s| s.index + 1);
        if pending {
            self.transition(SessionState::Delegating, format!("step {done} done"))
                .await
        } else if finished {
            self.complete().await
        } else {
            self.request_replan("plan has no runnable step left".to_string(), SessionState::Replanning)
                .await
        }
    }

    /// `StepFailed`: retry within budget, otherwise replan
    pub(super) async fn handle_step_failure(&mut self) -> Result<()> {
        let Some(step) = self.session.active().cloned() else {
            return self
                .transition(SessionState::Delegating, "no failed step on record")
                .await;
        };
        let number = step.index + 1;
        let failure = step.last_failure.clone().unwrap_or(FailureKind::WorkerError {
            message: "step failed without a recorded reason".to_string(),
            payload: None,
        });
        let max_retries = self.orch.config.max_step_retries;

        if failure.is_retryable() && step.attempts <= max_retries {
            if let Some(active) = self.session.active_mut() {
                active.status = StepStatus::Pending;
            }
            return self
                .transition(
                    SessionState::Delegating,
                    format!(
                        "retrying step {number} ({}/{max_retries}) after: {failure}",
                        step.attempts
                    ),
                )
                .await;
        }

        let reason = if failure.is_retryable() {
            format!(
                "step {number} ({}) failed after {} attempt(s): {failure}",
                step.capability, step.attempts
            )
        } else {
            format!("step {number} ({}): {failure}", step.capability)
        };
        self.request_replan(reason, SessionState::Replanning).await
    }

    /// Every step is done: persist `Completed`, then remember the plan
    pub(super) async fn complete(&mut self) -> Result<()> {
        self.session.active_step = None;
        self.transition(SessionState::Completed, "all steps succeeded")
            .await?;
        if self.session.state != SessionState::Completed {
            return Ok(());
        }

        if self.orch.config.learn_plans {
            self.learn().await?;
        }
        self.orch.emit(SessionEvent::SessionCompleted {
            session_id: self.session.id,
        });
        Ok(())
    }

    async fn learn(&mut self) -> Result<()> {
        let Some(plan) = self.session.plan.as_ref() else {
            return Ok(());
        };
        let steps = plan
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Succeeded)
            .map(Step::template)
            .collect();
        let quality = if self.session.replan_count == 0 && self.session.total_retries() == 0 {
            OutcomeQuality::Clean
        } else {
            OutcomeQuality::Recovered
        };
        let key = PlanMemory::fingerprint(&self.session.goal, &self.session.context);

        match self
            .orch
            .memory
            .store(key, self.session.goal.clone(), steps, quality)
            .await
        {
            Ok(record) => {
                info!(session_id = %self.session.id, record_id = %record.id, %quality, "Plan learned");
                self.learned_record = Some(record.id);
                self.session
                    .note(NoteLevel::Info, format!("learned plan stored ({quality})"));
            }
            Err(e) => {
                warn!(session_id = %self.session.id, error = %e, "Could not store learned plan");
                self.session
                    .note(NoteLevel::Warning, format!("could not store learned plan: {e}"));
            }
        }
        self.persist().await
    }
}
