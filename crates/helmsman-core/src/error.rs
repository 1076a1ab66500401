//! Error types for helmsman-core
//!
//! Engine-level failures only. Outcomes of a session (a step that failed, a
//! replan budget that ran out) are domain state recorded as
//! [`FailureKind`](crate::session::FailureKind), never as an `Error`.

use crate::checkpoint::CheckpointError;
use thiserror::Error;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Plan text could not be turned into steps
    #[error("planning error: {0}")]
    Planning(String),

    /// No session is stored under the given id
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The request does not fit the session's current state
    #[error("invalid session state: {0}")]
    InvalidState(String),

    /// Checkpoint resolution failed
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Plan memory failure
    #[error("memory error: {0}")]
    Memory(#[from] helmsman_memory::Error),

    /// Session store failure (SQLite)
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error (invalid settings, bad patterns)
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Human-readable rendering of errors for the CLI.
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Planning(msg) => format!("📋 Planning failed: {msg}"),
            Error::SessionNotFound(id) => format!("🔎 No session with id {id}."),
            Error::InvalidState(msg) => format!("🚦 {msg}"),
            Error::Checkpoint(e) => format!("✋ Checkpoint error: {e}"),
            Error::Memory(e) => format!("🧠 Plan memory error: {e}"),
            Error::Store(e) => format!("💾 Session store error: {e}"),
            Error::Serialization(e) => format!("💾 Stored data is unreadable: {e}"),
            Error::Configuration(msg) => format!("⚙️ Configuration error: {msg}"),
            Error::Internal(msg) => format!("❌ Internal error: {msg}"),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Planning(_) => Some(
                "💡 Plans are JSON ({\"steps\": [...]}) or one `capability: instruction` per line."
                    .to_string(),
            ),
            Error::SessionNotFound(_) => {
                Some("💡 Run `helmsman sessions list` to see stored sessions.".to_string())
            }
            Error::InvalidState(_) => {
                Some("💡 Wait for the running session to finish or cancel it first.".to_string())
            }
            Error::Checkpoint(_) => {
                Some("💡 List pending checkpoints and answer the current one.".to_string())
            }
            Error::Store(_) | Error::Memory(_) => {
                Some("💡 Check the data directory path and its permissions.".to_string())
            }
            Error::Configuration(_) => Some(
                "💡 Check config/default.toml, config/local.toml or HELMSMAN_* variables."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Format an error for display in the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = error.user_message();
    output.push('\n');
    if let Some(suggestion) = error.suggestion() {
        output.push('\n');
        output.push_str(&suggestion);
        output.push('\n');
    }
    output
}
