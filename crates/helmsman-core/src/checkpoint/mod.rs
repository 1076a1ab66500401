//! Checkpoint - human-in-the-loop suspension points
//!
//! A checkpoint pauses a session until a human approves, edits or rejects
//! the proposed content. Plans always pass a checkpoint before execution;
//! individual step results do when the oversight policy flags them.

use std::sync::Arc;

pub mod gate;
pub mod hub;
pub mod types;

pub use gate::{CheckpointGate, CheckpointOutcome};
pub use hub::CheckpointHub;
pub use types::{Checkpoint, CheckpointError, CheckpointSubject, Decision, Resolution};

/// Shared checkpoint hub type
pub type SharedCheckpointHub = Arc<CheckpointHub>;
