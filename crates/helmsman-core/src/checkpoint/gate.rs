//! Per-session checkpoint gate
//!
//! At most one checkpoint is pending per session. Raising suspends the caller
//! until a decision arrives, the timeout elapses (the configured default is
//! applied) or the session's cancellation token fires (resolves `Rejected`).
//! Once the token fires, submissions are refused; a decision acknowledged
//! before that is recorded as given, and the session still ends cancelled.

use super::types::{Checkpoint, CheckpointError, Decision, Resolution};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

struct Submitted {
    decision: Decision,
    edited: Option<String>,
}

struct PendingSlot {
    checkpoint: Checkpoint,
    resolver: oneshot::Sender<Submitted>,
}

/// Result of a raised checkpoint
#[derive(Debug, Clone)]
pub struct CheckpointOutcome {
    /// The checkpoint with its decision recorded
    pub checkpoint: Checkpoint,
}

impl CheckpointOutcome {
    /// Final decision
    #[must_use]
    pub fn decision(&self) -> Decision {
        self.checkpoint.decision
    }

    /// Edited content, for `Edited`
    #[must_use]
    pub fn edited_content(&self) -> Option<&str> {
        self.checkpoint.edited_content.as_deref()
    }

    /// Whether the timeout default was applied
    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.checkpoint.resolution == Some(Resolution::Timeout)
    }

    /// Whether the wait ended through cancellation
    #[must_use]
    pub fn cancelled(&self) -> bool {
        self.checkpoint.resolution == Some(Resolution::Cancellation)
    }
}

/// Checkpoint gate for a single session
pub struct CheckpointGate {
    session_id: Uuid,
    timeout: Duration,
    default_decision: Decision,
    cancel: CancellationToken,
    pending: Mutex<Option<PendingSlot>>,
    resolved: Mutex<Vec<Uuid>>,
}

impl CheckpointGate {
    /// Create a gate bound to a session's cancellation token
    #[must_use]
    pub fn new(
        session_id: Uuid,
        timeout: Duration,
        default_decision: Decision,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            session_id,
            timeout,
            default_decision,
            cancel,
            pending: Mutex::new(None),
            resolved: Mutex::new(Vec::new()),
        }
    }

    /// Owning session
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Raise a checkpoint and wait for it to resolve.
    ///
    /// Fails with [`CheckpointError::AlreadyPending`] if another checkpoint of
    /// this session is still waiting.
    pub async fn raise(
        &self,
        mut checkpoint: Checkpoint,
    ) -> std::result::Result<CheckpointOutcome, CheckpointError> {
        let mut rx = {
            let mut slot = self.pending.lock().await;
            if slot.is_some() {
                return Err(CheckpointError::AlreadyPending);
            }
            let (tx, rx) = oneshot::channel();
            *slot = Some(PendingSlot {
                checkpoint: checkpoint.clone(),
                resolver: tx,
            });
            rx
        };

        debug!(
            session_id = %self.session_id,
            checkpoint_id = %checkpoint.id,
            timeout_secs = self.timeout.as_secs(),
            "Checkpoint raised"
        );

        let (decision, edited, resolution) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.close_slot(&mut rx, Decision::Rejected, Resolution::Cancellation).await
            }
            submitted = &mut rx => match submitted {
                Ok(s) => (s.decision, s.edited, Resolution::Human),
                Err(_) => (Decision::Rejected, None, Resolution::Cancellation),
            },
            _ = tokio::time::sleep(self.timeout) => {
                self.close_slot(&mut rx, self.default_decision, Resolution::Timeout).await
            }
        };

        self.pending.lock().await.take();
        self.resolved.lock().await.push(checkpoint.id);

        checkpoint.resolve(decision, edited, resolution);
        match resolution {
            Resolution::Timeout => warn!(
                session_id = %self.session_id,
                checkpoint_id = %checkpoint.id,
                default = %decision,
                "Checkpoint timed out, applying default decision"
            ),
            _ => info!(
                session_id = %self.session_id,
                checkpoint_id = %checkpoint.id,
                decision = %decision,
                "Checkpoint resolved"
            ),
        }
        Ok(CheckpointOutcome { checkpoint })
    }

    /// Submit a decision for the pending checkpoint.
    ///
    /// Returns the checkpoint as resolved by this decision.
    pub async fn submit(
        &self,
        checkpoint_id: Uuid,
        decision: Decision,
        edited_content: Option<String>,
    ) -> std::result::Result<Checkpoint, CheckpointError> {
        let mut slot = self.pending.lock().await;
        let matches = slot
            .as_ref()
            .is_some_and(|p| p.checkpoint.id == checkpoint_id);
        if !matches {
            drop(slot);
            if self.resolved.lock().await.contains(&checkpoint_id) {
                return Err(CheckpointError::AlreadyResolved);
            }
            return Err(CheckpointError::NotFound);
        }

        let edited = match decision {
            Decision::Pending => return Err(CheckpointError::InvalidDecision),
            Decision::Edited => match edited_content {
                Some(text) if !text.trim().is_empty() => Some(text),
                _ => return Err(CheckpointError::InvalidDecision),
            },
            Decision::Approved | Decision::Rejected => None,
        };

        // Once the token fires, no decision is acknowledged
        if self.cancel.is_cancelled() {
            return Err(CheckpointError::AlreadyResolved);
        }

        // Hand off while holding the slot so the waiter never misses an
        // acknowledged decision
        let PendingSlot {
            mut checkpoint,
            resolver,
        } = slot.take().ok_or(CheckpointError::NotFound)?;
        self.resolved.lock().await.push(checkpoint_id);
        let sent = resolver.send(Submitted {
            decision,
            edited: edited.clone(),
        });
        drop(slot);

        if sent.is_err() {
            return Err(CheckpointError::AlreadyResolved);
        }
        checkpoint.resolve(decision, edited, Resolution::Human);
        Ok(checkpoint)
    }

    /// Close the slot after cancellation or timeout.
    ///
    /// A decision that was accepted before the slot closed is kept.
    async fn close_slot(
        &self,
        rx: &mut oneshot::Receiver<Submitted>,
        fallback: Decision,
        resolution: Resolution,
    ) -> (Decision, Option<String>, Resolution) {
        let taken = self.pending.lock().await.take();
        if taken.is_none() {
            if let Ok(s) = rx.try_recv() {
                return (s.decision, s.edited, Resolution::Human);
            }
        }
        (fallback, None, resolution)
    }

    /// The checkpoint currently waiting, if any
    pub async fn pending(&self) -> Option<Checkpoint> {
        self.pending
            .lock()
            .await
            .as_ref()
            .map(|p| p.checkpoint.clone())
    }
}
