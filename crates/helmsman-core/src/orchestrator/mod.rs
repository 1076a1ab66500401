//! Orchestrator - session state machine
//!
//! Turns a goal into a plan, gates it on human approval, delegates each step
//! to the worker bound to its capability tag, and recovers from failure by
//! retrying and replanning within configured budgets.
//!
//! # Module Structure
//!
//! - `config`: Budgets and timeouts (OrchestratorConfig)
//! - `core`: Orchestrator struct, builders and public operations
//! - `machine`: Per-session driver loop and shared transition helpers
//! - `planning`: Planning, replanning and plan approval
//! - `delegation`: Step delegation, review, retry and completion
//! - `types`: Result types

mod config;
mod core;
mod delegation;
mod machine;
mod planning;
mod types;

#[cfg(test)]
mod tests;

pub use config::OrchestratorConfig;
pub use core::Orchestrator;
pub use types::SessionOutcome;
