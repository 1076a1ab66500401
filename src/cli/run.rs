//! Run and resume commands
//!
//! `helmsman run <goal>` - start a session and drive it to the end
//! `helmsman resume <id>` - continue a stored session
//!
//! Checkpoints are answered interactively (approve / edit / reject) unless
//! `--auto-approve` is given. Ctrl+C cancels the session.

use crate::config::AppConfig;
use crate::engine::{self, Engine};
use anyhow::{Context, Result};
use helmsman_core::{
    CheckpointError, CheckpointSubject, Decision, Error as CoreError, Orchestrator, SessionEvent,
    SessionOutcome, SessionState, StepStatus,
};
use inquire::{Editor, InquireError, Select};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Start a new session for `goal`
pub async fn run(
    config: &AppConfig,
    goal: String,
    context: BTreeMap<String, String>,
    plan: Option<PathBuf>,
    auto_approve: bool,
) -> Result<()> {
    let engine = engine::build(config, plan.as_deref()).await?;
    let session_id = engine.orchestrator.start(goal.clone(), context).await?;
    println!("\n🧭 Session {session_id}");
    println!("   Goal: {goal}\n");
    drive(engine, session_id, false, auto_approve).await
}

/// Continue a stored session
pub async fn resume(config: &AppConfig, session_id: Uuid, auto_approve: bool) -> Result<()> {
    let engine = engine::build(config, None).await?;
    println!("\n🧭 Resuming session {session_id}\n");
    drive(engine, session_id, true, auto_approve).await
}

async fn drive(engine: Engine, session_id: Uuid, resumed: bool, auto_approve: bool) -> Result<()> {
    let Engine { orchestrator, bus } = engine;
    let events = bus.subscribe();

    let mut handle = if resumed {
        let engine = Arc::clone(&orchestrator);
        tokio::spawn(async move { engine.resume(session_id).await })
    } else {
        orchestrator.spawn(session_id)
    };
    let watcher = tokio::spawn(watch(
        Arc::clone(&orchestrator),
        events,
        session_id,
        auto_approve,
    ));

    let joined = tokio::select! {
        joined = &mut handle => joined,
        _ = tokio::signal::ctrl_c() => {
            println!("\n⏹️  Cancelling session {session_id}...");
            orchestrator.cancel(session_id).await?;
            (&mut handle).await
        }
    };
    watcher.abort();

    let outcome = joined.context("Session task stopped unexpectedly")??;
    print_outcome(&outcome);
    Ok(())
}

/// Print progress and answer checkpoints for one session
async fn watch(
    orchestrator: Arc<Orchestrator>,
    mut events: broadcast::Receiver<SessionEvent>,
    session_id: Uuid,
    auto_approve: bool,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress display fell behind");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if event.session_id() != session_id {
            continue;
        }

        match event {
            SessionEvent::StateChanged { from, to, .. } => {
                debug!(%from, %to, "State changed");
            }
            SessionEvent::StepStarted {
                index,
                capability,
                attempt,
                ..
            } => {
                let retry = if attempt > 1 {
                    format!(" (attempt {attempt})")
                } else {
                    String::new()
                };
                println!("▶️  Step {} [{capability}]{retry}", index + 1);
            }
            SessionEvent::StepFinished {
                index,
                success,
                duration_ms,
                ..
            } => {
                let mark = if success { "✅" } else { "❌" };
                println!("{mark} Step {} finished in {duration_ms}ms", index + 1);
            }
            SessionEvent::Replanning { reason, .. } => {
                println!("🔁 Replanning: {reason}");
            }
            SessionEvent::CheckpointRaised {
                checkpoint_id,
                subject,
                proposed,
                ..
            } => {
                answer_checkpoint(
                    &orchestrator,
                    session_id,
                    checkpoint_id,
                    subject,
                    proposed,
                    auto_approve,
                )
                .await;
            }
            SessionEvent::CheckpointResolved {
                decision,
                timed_out: true,
                ..
            } => {
                println!("⏱️  Checkpoint timed out, applied '{decision}'");
            }
            SessionEvent::SessionCompleted { .. }
            | SessionEvent::SessionFailed { .. }
            | SessionEvent::SessionCancelled { .. } => break,
            _ => {}
        }
    }
}

enum Answer {
    Decide(Decision, Option<String>),
    Cancel,
}

async fn answer_checkpoint(
    orchestrator: &Orchestrator,
    session_id: Uuid,
    checkpoint_id: Uuid,
    subject: CheckpointSubject,
    proposed: String,
    auto_approve: bool,
) {
    let answer = if auto_approve {
        println!("👍 Auto-approving {}", describe(&subject));
        Answer::Decide(Decision::Approved, None)
    } else {
        let reason = orchestrator
            .list_pending_checkpoints(session_id)
            .await
            .into_iter()
            .find(|c| c.id == checkpoint_id)
            .and_then(|c| c.reason);
        let prompt =
            tokio::task::spawn_blocking(move || prompt(&subject, &proposed, reason.as_deref()));
        match prompt.await {
            Ok(Ok(answer)) => answer,
            Ok(Err(e)) => {
                warn!(error = %e, "Checkpoint prompt failed, rejecting");
                Answer::Decide(Decision::Rejected, None)
            }
            Err(e) => {
                warn!(error = %e, "Checkpoint prompt task failed, rejecting");
                Answer::Decide(Decision::Rejected, None)
            }
        }
    };

    let (decision, edited) = match answer {
        Answer::Decide(decision, edited) => (decision, edited),
        Answer::Cancel => {
            println!("⏹️  Cancelling session {session_id}...");
            if let Err(e) = orchestrator.cancel(session_id).await {
                warn!(error = %e, "Cancel failed");
            }
            return;
        }
    };

    // The gate registers the checkpoint right after announcing it
    for _ in 0..50 {
        match orchestrator
            .submit_decision(checkpoint_id, decision, edited.clone())
            .await
        {
            Ok(_) => return,
            Err(CoreError::Checkpoint(CheckpointError::NotFound)) => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(CoreError::Checkpoint(CheckpointError::AlreadyResolved)) => {
                println!("⏱️  Too late: the checkpoint was already resolved");
                return;
            }
            Err(e) => {
                println!("⚠️  Decision not accepted: {e}");
                return;
            }
        }
    }
    warn!(%checkpoint_id, "Checkpoint never became pending");
}

fn describe(subject: &CheckpointSubject) -> String {
    match subject {
        CheckpointSubject::Plan { version, .. } => format!("plan v{version}"),
        CheckpointSubject::Step { index, .. } => format!("result of step {}", index + 1),
    }
}

fn prompt(subject: &CheckpointSubject, proposed: &str, reason: Option<&str>) -> Result<Answer> {
    println!("\n✋ Review {}", describe(subject));
    if let Some(reason) = reason {
        println!("   Why: {reason}");
    }
    println!("─────────────────────────");
    println!("{proposed}");
    println!("─────────────────────────");

    let choice = Select::new("Decision:", vec!["Approve", "Edit", "Reject"])
        .with_help_message("Esc or Ctrl+C cancels the session")
        .prompt();
    match choice {
        Ok("Approve") => Ok(Answer::Decide(Decision::Approved, None)),
        Ok("Edit") => {
            let edited = Editor::new("Edit the proposal:")
                .with_predefined_text(proposed)
                .with_file_extension(".json")
                .prompt()?;
            Ok(Answer::Decide(Decision::Edited, Some(edited)))
        }
        Ok(_) => Ok(Answer::Decide(Decision::Rejected, None)),
        Err(InquireError::OperationInterrupted | InquireError::OperationCanceled) => {
            Ok(Answer::Cancel)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_outcome(outcome: &SessionOutcome) {
    let session = &outcome.session;
    let icon = match session.state {
        SessionState::Completed => "🎉",
        SessionState::Cancelled => "⏹️ ",
        _ => "❌",
    };
    println!("\n{icon} Session {} {}", session.id, session.state);
    if let Some(failure) = &session.failure {
        println!("   Reason: {failure}");
    }
    if let Some(plan) = &session.plan {
        println!("   Plan v{} ({} replan(s))", plan.version, session.replan_count);
        for step in &plan.steps {
            let mark = match step.status {
                StepStatus::Succeeded => "✅",
                StepStatus::Failed => "❌",
                StepStatus::InProgress => "⏳",
                StepStatus::Skipped => "⏭️ ",
                StepStatus::Pending => "▫️ ",
            };
            println!(
                "   {mark} {}. [{}] {}",
                step.index + 1,
                step.capability,
                step.instruction
            );
            if let Some(result) = &step.result {
                for line in result.text.lines().take(5) {
                    println!("        {line}");
                }
            }
        }
    }
    if let Some(record) = outcome.learned_record {
        println!("   🧠 Learned plan {record}");
    }
    println!("   Took {}ms", outcome.duration_ms);
}
