//! Orchestrator core structure
//!
//! Contains the shared `Orchestrator` and its builder methods. The engine is
//! shared by all sessions; each driven session gets its own
//! [`SessionMachine`](super::machine::SessionMachine).

use crate::cancellation::CancellationController;
use crate::checkpoint::{Checkpoint, CheckpointHub, Decision, Resolution};
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, SessionEvent};
use crate::planner::PlanGenerator;
use crate::policy::OversightPolicy;
use crate::registry::WorkerRegistry;
use crate::session::{FailureKind, NoteLevel, Session, SessionState, StepStatus};
use crate::store::{self, MemoryStore, SessionStore};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use helmsman_memory::{PlanMemory, PlanMemoryConfig};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::OrchestratorConfig;
use super::machine::SessionMachine;
use super::types::SessionOutcome;

/// Shared engine that drives sessions
pub struct Orchestrator {
    pub(crate) planner: Arc<dyn PlanGenerator>,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) memory: Arc<PlanMemory>,
    pub(crate) checkpoints: Arc<CheckpointHub>,
    pub(crate) cancellations: Arc<CancellationController>,
    pub(crate) event_bus: Option<Arc<EventBus>>,
    pub(crate) policy: OversightPolicy,
    pub(crate) config: OrchestratorConfig,
    /// Sessions currently being driven by this engine
    pub(crate) running: Arc<DashMap<Uuid, Instant>>,
}

impl Orchestrator {
    /// Create an orchestrator with in-memory stores
    #[must_use]
    pub fn new(
        planner: Arc<dyn PlanGenerator>,
        registry: Arc<WorkerRegistry>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            registry,
            store: Arc::new(MemoryStore::new()),
            memory: Arc::new(PlanMemory::in_memory(PlanMemoryConfig::default())),
            checkpoints: Arc::new(CheckpointHub::new()),
            cancellations: Arc::new(CancellationController::new()),
            event_bus: None,
            policy: OversightPolicy::permissive(),
            config,
            running: Arc::new(DashMap::new()),
        }
    }

    /// Set the session store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = store;
        self
    }

    /// Set the plan memory
    #[must_use]
    pub fn with_memory(mut self, memory: Arc<PlanMemory>) -> Self {
        self.memory = memory;
        self
    }

    /// Share a checkpoint hub
    #[must_use]
    pub fn with_checkpoint_hub(mut self, hub: Arc<CheckpointHub>) -> Self {
        self.checkpoints = hub;
        self
    }

    /// Share a cancellation controller
    #[must_use]
    pub fn with_cancellation(mut self, controller: Arc<CancellationController>) -> Self {
        self.cancellations = controller;
        self
    }

    /// Set the event bus
    #[must_use]
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Set the step oversight policy
    #[must_use]
    pub fn with_policy(mut self, policy: OversightPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Worker registry
    #[must_use]
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// Session store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Plan memory
    #[must_use]
    pub fn memory(&self) -> &Arc<PlanMemory> {
        &self.memory
    }

    /// Checkpoint hub
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointHub> {
        &self.checkpoints
    }

    /// Event bus, if configured
    #[must_use]
    pub fn event_bus(&self) -> Option<&Arc<EventBus>> {
        self.event_bus.as_ref()
    }

    /// Number of sessions being driven right now
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Create and persist a new session in `Planning` without driving it.
    pub async fn start(
        &self,
        goal: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> Result<Uuid> {
        self.config.validate()?;
        let mut session = Session::new(goal, context);
        session.note(NoteLevel::Info, "session created");
        store::save_session(self.store.as_ref(), &session).await?;
        info!(session_id = %session.id, goal = %session.goal, "Session created");
        Ok(session.id)
    }

    /// Create a session and drive it to a terminal state
    #[instrument(skip(self, goal, context))]
    pub async fn run(
        &self,
        goal: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> Result<SessionOutcome> {
        let session_id = self.start(goal, context).await?;
        self.drive(session_id, false).await
    }

    /// Drive a freshly started session
    #[instrument(skip(self))]
    pub async fn execute(&self, session_id: Uuid) -> Result<SessionOutcome> {
        self.drive(session_id, false).await
    }

    /// Continue a stored session from its last persisted state.
    ///
    /// Terminal sessions are returned as-is.
    #[instrument(skip(self))]
    pub async fn resume(&self, session_id: Uuid) -> Result<SessionOutcome> {
        self.drive(session_id, true).await
    }

    /// Drive a session on its own task
    pub fn spawn(self: &Arc<Self>, session_id: Uuid) -> JoinHandle<Result<SessionOutcome>> {
        let engine = Arc::clone(self);
        tokio::spawn(async move { engine.drive(session_id, false).await })
    }

    /// Create a session and drive it on its own task
    pub async fn spawn_run(
        self: &Arc<Self>,
        goal: impl Into<String>,
        context: BTreeMap<String, String>,
    ) -> Result<(Uuid, JoinHandle<Result<SessionOutcome>>)> {
        let session_id = self.start(goal, context).await?;
        Ok((session_id, self.spawn(session_id)))
    }

    /// Request cancellation. Idempotent.
    ///
    /// A running session observes its token; a stored session that is not
    /// running is moved to `Cancelled` directly while holding the run claim,
    /// so no driver can pick it up in between. Returns `false` when the
    /// session had already ended.
    #[instrument(skip(self))]
    pub async fn cancel(&self, session_id: Uuid) -> Result<bool> {
        let claim = loop {
            if let Some(token) = self.cancellations.token(session_id) {
                token.cancel();
                return Ok(true);
            }
            match RunClaim::acquire(&self.running, &self.cancellations, session_id) {
                Ok(claim) => break claim,
                // A driver is between claiming and releasing its token
                Err(_) => tokio::task::yield_now().await,
            }
        };
        claim.token.cancel();

        let mut session = store::load_session(self.store.as_ref(), session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.state.is_terminal() {
            debug!(%session_id, state = %session.state, "Cancel ignored for finished session");
            return Ok(false);
        }

        let from = session.state;
        if let Some(plan) = session.plan.as_mut() {
            for step in plan
                .steps
                .iter_mut()
                .filter(|s| s.status == StepStatus::InProgress)
            {
                step.status = StepStatus::Pending;
                step.started_at = None;
            }
        }
        if let Some(mut checkpoint) = session.pending_checkpoint.take() {
            checkpoint.resolve(Decision::Rejected, None, Resolution::Cancellation);
            session.checkpoints.push(checkpoint);
        }
        session.failure = Some(FailureKind::Cancelled);
        session.state = SessionState::Cancelled;
        session.note(NoteLevel::Info, "cancelled while not running");
        store::save_session(self.store.as_ref(), &session).await?;
        drop(claim);

        info!(%session_id, %from, "Stored session cancelled");
        self.emit(SessionEvent::StateChanged {
            session_id,
            from,
            to: SessionState::Cancelled,
        });
        self.emit(SessionEvent::SessionCancelled { session_id });
        Ok(true)
    }

    /// Cancel every running session
    pub fn shutdown(&self) {
        self.cancellations.cancel_all();
    }

    /// Read a session snapshot
    pub async fn session(&self, session_id: Uuid) -> Result<Option<Session>> {
        store::load_session(self.store.as_ref(), session_id).await
    }

    /// All stored sessions, most recent first
    pub async fn sessions(&self) -> Result<Vec<Session>> {
        store::list_sessions(self.store.as_ref()).await
    }

    /// Submit a decision for a pending checkpoint
    pub async fn submit_decision(
        &self,
        checkpoint_id: Uuid,
        decision: Decision,
        edited_content: Option<String>,
    ) -> Result<Checkpoint> {
        Ok(self
            .checkpoints
            .submit_decision(checkpoint_id, decision, edited_content)
            .await?)
    }

    /// Pending checkpoints of a session
    pub async fn list_pending_checkpoints(&self, session_id: Uuid) -> Vec<Checkpoint> {
        self.checkpoints.list_pending_checkpoints(session_id).await
    }

    async fn drive(&self, session_id: Uuid, resumed: bool) -> Result<SessionOutcome> {
        self.config.validate()?;
        let claim = RunClaim::acquire(&self.running, &self.cancellations, session_id)?;
        let session = store::load_session(self.store.as_ref(), session_id)
            .await?
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;

        if session.state.is_terminal() {
            debug!(%session_id, state = %session.state, "Session already finished");
            return Ok(SessionOutcome {
                session,
                learned_record: None,
                duration_ms: 0,
            });
        }

        let cancel = claim.token.clone();
        let gate = self.checkpoints.open_gate(
            session_id,
            self.config.checkpoint_timeout,
            self.config.checkpoint_default,
            cancel.clone(),
        );

        let result = SessionMachine::new(self, session, gate, cancel, resumed)
            .run()
            .await;

        self.checkpoints.close_gate(session_id);
        result
    }
}

/// Marks a session as driven for as long as the claim lives.
///
/// The claim owns the session's cancellation token; both are released
/// together on drop.
struct RunClaim {
    running: Arc<DashMap<Uuid, Instant>>,
    cancellations: Arc<CancellationController>,
    session_id: Uuid,
    token: CancellationToken,
}

impl RunClaim {
    fn acquire(
        running: &Arc<DashMap<Uuid, Instant>>,
        cancellations: &Arc<CancellationController>,
        session_id: Uuid,
    ) -> Result<Self> {
        match running.entry(session_id) {
            Entry::Occupied(_) => Err(Error::InvalidState(format!(
                "session {session_id} is already running"
            ))),
            Entry::Vacant(slot) => {
                let token = cancellations.create(session_id);
                slot.insert(Instant::now());
                Ok(Self {
                    running: Arc::clone(running),
                    cancellations: Arc::clone(cancellations),
                    session_id,
                    token,
                })
            }
        }
    }
}

impl Drop for RunClaim {
    fn drop(&mut self) {
        self.cancellations.release(self.session_id);
        self.running.remove(&self.session_id);
    }
}
