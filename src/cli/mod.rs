//! CLI module for Helmsman
//!
//! - `run`: plan and execute a goal under human oversight
//! - `resume`: continue a stored session
//! - `sessions`: inspect stored sessions
//! - `memory`: inspect learned plans

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod memory;
pub mod run;
pub mod sessions;

/// Helmsman orchestration CLI
#[derive(Parser, Debug)]
#[command(name = "helmsman")]
#[command(about = "Plan, delegate and supervise multi-step tasks")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan and run a goal
    Run {
        /// What to accomplish
        goal: String,
        /// Context fields, as key=value (repeatable)
        #[arg(short, long = "context", value_parser = parse_context)]
        context: Vec<(String, String)>,
        /// Use this plan file instead of the planner command
        #[arg(long)]
        plan: Option<PathBuf>,
        /// Approve every checkpoint without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Continue a stored session from its last state
    Resume {
        /// Session id
        session_id: String,
        /// Approve every checkpoint without prompting
        #[arg(long)]
        auto_approve: bool,
    },
    /// Inspect stored sessions
    #[command(subcommand)]
    Sessions(SessionsCommands),
    /// Inspect learned plans
    #[command(subcommand)]
    Memory(MemoryCommands),
}

#[derive(Subcommand, Debug)]
pub enum SessionsCommands {
    /// List sessions, most recent first
    List,
    /// Show one session in detail
    Show {
        /// Session id
        session_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum MemoryCommands {
    /// List learned plans
    List,
    /// Find the learned plan that would seed a goal
    Search {
        /// Goal text
        goal: String,
        /// Context fields, as key=value (repeatable)
        #[arg(short, long = "context", value_parser = parse_context)]
        context: Vec<(String, String)>,
    },
}

fn parse_context(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got '{raw}'")),
    }
}

fn parse_session_id(raw: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(raw.trim())
        .map_err(|e| anyhow::anyhow!("'{raw}' is not a session id: {e}"))
}

/// Run the CLI command
pub async fn run(cli: Cli, config: crate::config::AppConfig) -> anyhow::Result<()> {
    match cli.command {
        Some(Commands::Run {
            goal,
            context,
            plan,
            auto_approve,
        }) => {
            let context = context.into_iter().collect();
            run::run(&config, goal, context, plan, auto_approve).await
        }
        Some(Commands::Resume {
            session_id,
            auto_approve,
        }) => run::resume(&config, parse_session_id(&session_id)?, auto_approve).await,
        Some(Commands::Sessions(cmd)) => sessions::run(&config, cmd).await,
        Some(Commands::Memory(cmd)) => memory::run(&config, cmd).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}
