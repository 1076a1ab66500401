//! Plan memory CLI commands
//!
//! `helmsman memory` - Inspect learned plans

use super::MemoryCommands;
use crate::config::AppConfig;
use crate::engine;
use anyhow::Result;
use helmsman_core::{LearnedPlanRecord, PlanMemory};
use std::collections::BTreeMap;

/// Run memory command
pub async fn run(config: &AppConfig, cmd: MemoryCommands) -> Result<()> {
    match cmd {
        MemoryCommands::List => list(config).await,
        MemoryCommands::Search { goal, context } => {
            search(config, &goal, context.into_iter().collect()).await
        }
    }
}

/// List learned plans, newest first
async fn list(config: &AppConfig) -> Result<()> {
    println!("\n🧠 Learned plans\n");

    let memory = engine::open_memory(config).await?;
    let mut records = memory.list().await?;

    if records.is_empty() {
        println!("  Nothing learned yet.");
        println!("  Plans are remembered when a session completes.");
        println!();
        return Ok(());
    }

    records.reverse();
    for record in &records {
        print_record(record);
    }
    println!("  {} record(s)\n", records.len());
    Ok(())
}

/// Show the record that would seed a new session for `goal`
async fn search(config: &AppConfig, goal: &str, context: BTreeMap<String, String>) -> Result<()> {
    let memory = engine::open_memory(config).await?;
    let key = PlanMemory::fingerprint(goal, &context);

    println!("\n🔎 Fingerprint {} [{}]\n", key.short(), key.terms.join(" "));

    match memory.retrieve(&key).await? {
        Some(hit) => {
            println!("  Match score {:.2}\n", hit.score);
            print_record(&hit.record);
        }
        None => {
            println!(
                "  No learned plan scores at least {:.2}.\n",
                memory.config().similarity_threshold
            );
        }
    }
    Ok(())
}

fn print_record(record: &LearnedPlanRecord) {
    println!(
        "  {} {} ({}, {})",
        record.fingerprint.short(),
        record.goal,
        record.outcome,
        record.created_at.format("%Y-%m-%d %H:%M")
    );
    for line in helmsman_core::render_plan_text(&record.steps).lines() {
        println!("      {line}");
    }
    println!();
}
