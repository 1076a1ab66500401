//! Cancellation Controller
//!
//! One cancellation token per session, each a child of a process-wide root.
//! Cancelling the root (shutdown) reaches every session; cancelling a session
//! reaches only that session and the worker calls it has in flight.
//!
//! ```ignore
//! let controller = CancellationController::new();
//! let token = controller.create(session_id);
//! // ... hand `token` to the session ...
//! controller.cancel(session_id);
//! ```

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Issues and revokes per-session cancellation tokens
pub struct CancellationController {
    root: CancellationToken,
    sessions: DashMap<Uuid, CancellationToken>,
}

impl Default for CancellationController {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationController {
    /// Create a controller with a fresh root token
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(CancellationToken::new())
    }

    /// Create a controller under an existing token (e.g. a shutdown token)
    #[must_use]
    pub fn with_root(root: CancellationToken) -> Self {
        Self {
            root,
            sessions: DashMap::new(),
        }
    }

    /// Token for a session, created on first use
    pub fn create(&self, session_id: Uuid) -> CancellationToken {
        self.sessions
            .entry(session_id)
            .or_insert_with(|| {
                debug!(%session_id, "Cancellation token created");
                self.root.child_token()
            })
            .clone()
    }

    /// Token for a session, if one exists
    #[must_use]
    pub fn token(&self, session_id: Uuid) -> Option<CancellationToken> {
        self.sessions.get(&session_id).map(|t| t.clone())
    }

    /// Request cancellation. Idempotent.
    ///
    /// Returns `false` when the session has no live token.
    pub fn cancel(&self, session_id: Uuid) -> bool {
        match self.sessions.get(&session_id) {
            Some(token) => {
                if !token.is_cancelled() {
                    info!(%session_id, "Session cancellation requested");
                }
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether cancellation was requested for a session
    #[must_use]
    pub fn is_cancelled(&self, session_id: Uuid) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(|t| t.is_cancelled())
    }

    /// Drop a session's token once the session is done with it
    pub fn release(&self, session_id: Uuid) {
        self.sessions.remove(&session_id);
    }

    /// Cancel every session
    pub fn cancel_all(&self) {
        info!(sessions = self.sessions.len(), "Cancelling all sessions");
        self.root.cancel();
    }

    /// Sessions holding a token
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests;
