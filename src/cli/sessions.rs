//! Session CLI commands
//!
//! `helmsman sessions` - Inspect stored sessions

use super::{parse_session_id, SessionsCommands};
use crate::config::AppConfig;
use crate::engine;
use anyhow::Result;
use helmsman_core::store::{list_sessions, load_session};
use helmsman_core::{
    CheckpointSubject, Decision, NoteLevel, Resolution, Session, SessionState, StepStatus,
};

/// Run sessions command
pub async fn run(config: &AppConfig, cmd: SessionsCommands) -> Result<()> {
    match cmd {
        SessionsCommands::List => list(config).await,
        SessionsCommands::Show { session_id } => show(config, &session_id).await,
    }
}

fn state_icon(state: SessionState) -> &'static str {
    match state {
        SessionState::Completed => "✅",
        SessionState::Failed => "❌",
        SessionState::Cancelled => "⏹️ ",
        SessionState::AwaitingPlanApproval => "✋",
        _ => "⏳",
    }
}

/// List all sessions
async fn list(config: &AppConfig) -> Result<()> {
    println!("\n🧭 Sessions\n");

    let store = engine::open_store(config).await?;
    let sessions = list_sessions(store.as_ref()).await?;

    if sessions.is_empty() {
        println!("  No sessions found.");
        println!();
        println!("  Start one:");
        println!("    helmsman run \"list the files in /data\"");
        println!();
        return Ok(());
    }

    for session in &sessions {
        let row = session.summary();
        println!(
            "  {} {} {:22} {}/{} steps | {} replan(s) | {}",
            state_icon(row.state),
            row.id,
            row.state.as_str(),
            row.steps_done,
            row.steps_total,
            row.replan_count,
            row.updated_at.format("%Y-%m-%d %H:%M")
        );
        println!("     {}", truncate(&row.goal, 72));
    }

    println!();
    Ok(())
}

/// Show one session
async fn show(config: &AppConfig, raw_id: &str) -> Result<()> {
    let id = parse_session_id(raw_id)?;
    let store = engine::open_store(config).await?;

    let Some(session) = load_session(store.as_ref(), id).await? else {
        println!("\n❌ Session '{raw_id}' not found.\n");
        return Ok(());
    };
    print_session(&session);
    Ok(())
}

fn print_session(session: &Session) {
    println!(
        "\n{} Session {} ({})\n",
        state_icon(session.state),
        session.id,
        session.state
    );
    println!("  Goal: {}", session.goal);
    for (key, value) in &session.context {
        println!("    {key} = {value}");
    }
    if let Some(failure) = &session.failure {
        println!("  Failure: {failure}");
    }
    println!(
        "  Replans: {} | Edit rounds: {} | Retries: {}",
        session.replan_count,
        session.edit_rounds,
        session.total_retries()
    );

    if let Some(plan) = &session.plan {
        let seeded = plan
            .seeded_from
            .as_deref()
            .map(|d| format!(" (seeded from {})", &d[..d.len().min(12)]))
            .unwrap_or_default();
        println!("\n  Plan v{}{seeded}:", plan.version);
        for step in &plan.steps {
            let mark = match step.status {
                StepStatus::Succeeded => "✓",
                StepStatus::Failed => "✗",
                StepStatus::InProgress => "…",
                StepStatus::Skipped => "-",
                StepStatus::Pending => " ",
            };
            let worker = step
                .worker
                .as_ref()
                .map(|w| format!(" via {}", w.identity))
                .unwrap_or_default();
            println!(
                "    [{mark}] {}. [{}] {}{worker}",
                step.index + 1,
                step.capability,
                step.instruction
            );
            if step.attempts > 1 {
                println!("         attempts: {}", step.attempts);
            }
            if let Some(failure) = &step.last_failure {
                println!("         last failure: {failure}");
            }
            if let Some(result) = &step.result {
                println!("         → {}", truncate(&result.text, 100));
            }
        }
    }

    if !session.plan_history.is_empty() {
        let versions: Vec<String> = session
            .plan_history
            .iter()
            .map(|p| format!("v{}", p.version))
            .collect();
        println!("\n  Superseded plans: {}", versions.join(", "));
    }

    if let Some(pending) = &session.pending_checkpoint {
        println!(
            "\n  ✋ Waiting on checkpoint {} ({})",
            pending.id,
            subject_label(&pending.subject)
        );
    }

    if !session.checkpoints.is_empty() {
        println!("\n  Checkpoints:");
        for checkpoint in &session.checkpoints {
            let how = match checkpoint.resolution {
                Some(Resolution::Human) => "by human",
                Some(Resolution::Timeout) => "on timeout",
                Some(Resolution::Cancellation) => "on cancel",
                None => "",
            };
            let edited = if checkpoint.decision == Decision::Edited {
                " (with edits)"
            } else {
                ""
            };
            println!(
                "    • {} {}{edited} {how}",
                subject_label(&checkpoint.subject),
                checkpoint.decision
            );
        }
    }

    if !session.log.is_empty() {
        println!("\n  Log:");
        for note in &session.log {
            let level = match note.level {
                NoteLevel::Info => " ",
                NoteLevel::Warning => "!",
            };
            println!(
                "   {level} {} [{}] {}",
                note.at.format("%H:%M:%S"),
                note.state,
                note.text
            );
        }
    }
    println!();
}

fn subject_label(subject: &CheckpointSubject) -> String {
    match subject {
        CheckpointSubject::Plan { version, .. } => format!("plan v{version}"),
        CheckpointSubject::Step { index, .. } => format!("step {}", index + 1),
    }
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max && !text.contains('\n') {
        return line.to_string();
    }
    let cut: String = line.chars().take(max).collect();
    format!("{cut}…")
}
