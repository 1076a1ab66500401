//! Process-wide checkpoint directory
//!
//! Each running session opens a [`CheckpointGate`] here; callers outside the
//! engine submit decisions and list pending checkpoints by id only.

use super::gate::CheckpointGate;
use super::types::{Checkpoint, CheckpointError, Decision};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Registry of open checkpoint gates, one per running session
#[derive(Default)]
pub struct CheckpointHub {
    gates: DashMap<Uuid, Arc<CheckpointGate>>,
}

impl CheckpointHub {
    /// Create an empty hub
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the gate for a session
    pub fn open_gate(
        &self,
        session_id: Uuid,
        timeout: Duration,
        default_decision: Decision,
        cancel: CancellationToken,
    ) -> Arc<CheckpointGate> {
        let gate = Arc::new(CheckpointGate::new(
            session_id,
            timeout,
            default_decision,
            cancel,
        ));
        self.gates.insert(session_id, Arc::clone(&gate));
        gate
    }

    /// Close a session's gate
    pub fn close_gate(&self, session_id: Uuid) {
        self.gates.remove(&session_id);
    }

    fn snapshot(&self) -> Vec<Arc<CheckpointGate>> {
        self.gates.iter().map(|g| Arc::clone(g.value())).collect()
    }

    /// Submit a decision for a pending checkpoint.
    pub async fn submit_decision(
        &self,
        checkpoint_id: Uuid,
        decision: Decision,
        edited_content: Option<String>,
    ) -> std::result::Result<Checkpoint, CheckpointError> {
        let mut outcome = Err(CheckpointError::NotFound);
        for gate in self.snapshot() {
            match gate
                .submit(checkpoint_id, decision, edited_content.clone())
                .await
            {
                Err(CheckpointError::NotFound) => continue,
                other => {
                    outcome = other;
                    break;
                }
            }
        }
        outcome
    }

    /// Pending checkpoints of one session (at most one)
    pub async fn list_pending_checkpoints(&self, session_id: Uuid) -> Vec<Checkpoint> {
        let gate = self.gates.get(&session_id).map(|g| Arc::clone(g.value()));
        match gate {
            Some(gate) => gate.pending().await.into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Pending checkpoints across all sessions, oldest first
    pub async fn list_all_pending(&self) -> Vec<Checkpoint> {
        let mut pending = Vec::new();
        for gate in self.snapshot() {
            if let Some(checkpoint) = gate.pending().await {
                pending.push(checkpoint);
            }
        }
        pending.sort_by_key(|c| c.created_at);
        pending
    }

    /// Number of open gates
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.gates.len()
    }
}
