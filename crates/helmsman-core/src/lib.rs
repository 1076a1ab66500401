//! Helmsman Core - Orchestration Engine
//!
//! This crate drives multi-step tasks across capability-tagged workers under
//! human oversight, including:
//! - Sessions: the persisted record of one task run
//! - Planning: turning a goal into an ordered plan, seeded from plan memory
//! - Delegation: routing each step to the worker bound to its capability
//! - Checkpoints: blocking on human approval of plans and flagged steps
//! - Recovery: bounded step retries and bounded replanning
//! - Cancellation: one monotonic token per session
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────── Orchestrator ────────────────┐
//!  goal ──►    │ SessionMachine (one per driven session)       │
//!              │  Planning ► AwaitingPlanApproval ► Delegating │
//!              │  ► WaitingForStep ► StepSucceeded/StepFailed  │
//!              └──┬──────────┬─────────────┬──────────┬───────┘
//!                 │          │             │          │
//!          PlanGenerator  WorkerRegistry  CheckpointHub  SessionStore
//!                                              │
//!                                       PlanMemory (helmsman-memory)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cancellation;
pub mod checkpoint;
pub mod error;
pub mod event_bus;
pub mod orchestrator;
pub mod plan_text;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod session;
pub mod store;

pub use cancellation::CancellationController;
pub use checkpoint::{
    Checkpoint, CheckpointError, CheckpointGate, CheckpointHub, CheckpointOutcome,
    CheckpointSubject, Decision, Resolution, SharedCheckpointHub,
};
pub use error::{format_error_for_cli, Error, Result, UserFriendlyError};
pub use event_bus::{EventBus, SessionEvent};
pub use orchestrator::{Orchestrator, OrchestratorConfig, SessionOutcome};
pub use plan_text::{parse_plan_text, render_plan_text};
pub use planner::{PlanGenerator, PlanRequest, SeededPlanGenerator, StaticPlanGenerator};
pub use policy::{OversightConfig, OversightPolicy};
pub use registry::{
    PersistedRegistry, RegistryEvent, RegistryEventKind, Worker, WorkerFailure, WorkerHandle,
    WorkerRegistry, REGISTRY_KEY,
};
pub use session::{
    FailureKind, NoteLevel, Plan, Session, SessionNote, SessionState, SessionSummary, Step,
    StepOutput, StepStatus, WorkerBinding,
};
pub use store::{
    default_data_dir, MemoryStore, SessionBackend, SessionBackendConfig, SessionStore,
    SqliteStore,
};

pub use helmsman_memory::{
    Fingerprint, LearnedPlanRecord, OutcomeQuality, PlanMemory, PlanMemoryConfig, ScoredRecord,
    StepTemplate,
};
