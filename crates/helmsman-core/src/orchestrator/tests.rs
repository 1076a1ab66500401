//! Orchestrator tests

use super::*;
use crate::checkpoint::Decision;
use crate::error::Error;
use crate::event_bus::{EventBus, SessionEvent};
use crate::planner::{MockPlanGenerator, PlanGenerator, PlanRequest, StaticPlanGenerator};
use crate::policy::OversightPolicy;
use crate::registry::{Worker, WorkerFailure, WorkerHandle, WorkerRegistry};
use crate::session::{FailureKind, Plan, Session, SessionState, StepOutput, StepStatus};
use crate::store::{self, MemoryStore, SessionStore};
use async_trait::async_trait;
use helmsman_memory::{OutcomeQuality, PlanMemory, StepTemplate};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Worker that replays scripted results, then echoes the instruction
#[derive(Default)]
struct ScriptedWorker {
    script: Mutex<VecDeque<Result<StepOutput, WorkerFailure>>>,
    calls: AtomicUsize,
    snapshot: Option<serde_json::Value>,
    restored: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedWorker {
    fn failing_times(n: usize) -> Self {
        let script = (0..n)
            .map(|i| Err(WorkerFailure::new(format!("flaky #{i}"))))
            .collect();
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    fn with_snapshot(state: serde_json::Value) -> Self {
        Self {
            snapshot: Some(state),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn invoke(
        &self,
        instruction: &str,
        _cancel: CancellationToken,
    ) -> Result<StepOutput, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| Ok(StepOutput::text(format!("done: {instruction}"))))
    }

    async fn snapshot_state(&self) -> Result<serde_json::Value, WorkerFailure> {
        Ok(self.snapshot.clone().unwrap_or(serde_json::Value::Null))
    }

    async fn restore_state(&self, state: serde_json::Value) -> Result<(), WorkerFailure> {
        self.restored.lock().unwrap().push(state);
        Ok(())
    }
}

/// Worker that only returns once its token fires
struct BlockingWorker;

#[async_trait]
impl Worker for BlockingWorker {
    async fn invoke(
        &self,
        _instruction: &str,
        cancel: CancellationToken,
    ) -> Result<StepOutput, WorkerFailure> {
        cancel.cancelled().await;
        Err(WorkerFailure::new("interrupted"))
    }
}

/// Plan generator that never answers
#[derive(Default)]
struct StalledPlanner {
    asked: Notify,
}

#[async_trait]
impl PlanGenerator for StalledPlanner {
    async fn generate_plan(&self, _request: &PlanRequest) -> Result<String, WorkerFailure> {
        self.asked.notify_one();
        std::future::pending().await
    }
}

/// Store whose first load of one key parks until released
struct GatedStore {
    inner: MemoryStore,
    gated_key: String,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedStore {
    fn new(inner: MemoryStore, session_id: uuid::Uuid) -> Self {
        Self {
            inner,
            gated_key: crate::session::session_key(session_id),
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl SessionStore for GatedStore {
    async fn save(&self, key: &str, blob: &str) -> crate::error::Result<()> {
        self.inner.save(key, blob).await
    }

    async fn load(&self, key: &str) -> crate::error::Result<Option<String>> {
        if key == self.gated_key && self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.load(key).await
    }

    async fn delete(&self, key: &str) -> crate::error::Result<bool> {
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> crate::error::Result<bool> {
        self.inner.exists(key).await
    }

    async fn list_keys(&self) -> crate::error::Result<Vec<String>> {
        self.inner.list_keys().await
    }

    async fn count(&self) -> crate::error::Result<usize> {
        self.inner.count().await
    }
}

const THREE_STEPS: &str = "browse: open the dashboard\nread-files: read report.csv\nexecute-code: plot the totals";

fn config() -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_checkpoint_timeout(Duration::from_millis(10), Decision::Approved)
        .with_worker_timeout(Duration::from_secs(5))
        .with_plan_timeout(Duration::from_secs(5))
}

async fn registry_with(workers: Vec<(&str, Arc<dyn Worker>)>) -> Arc<WorkerRegistry> {
    let registry = WorkerRegistry::new();
    for (tag, worker) in workers {
        registry
            .register(tag, WorkerHandle::new(format!("{tag}-1"), worker))
            .await
            .unwrap();
    }
    Arc::new(registry)
}

fn orchestrator(
    planner: Arc<dyn PlanGenerator>,
    registry: Arc<WorkerRegistry>,
    config: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::new(planner, registry, config)
}

#[test]
fn test_orchestrator_config() {
    let config = OrchestratorConfig::new()
        .with_max_step_retries(4)
        .with_max_replans(1)
        .with_max_edit_rounds(3)
        .with_learning(false);

    assert_eq!(config.max_step_retries, 4);
    assert_eq!(config.max_replans, 1);
    assert_eq!(config.max_edit_rounds, 3);
    assert!(!config.learn_plans);
    assert_eq!(config.checkpoint_default, Decision::Rejected);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_rejects_edited_default() {
    let config =
        OrchestratorConfig::new().with_checkpoint_timeout(Duration::from_secs(1), Decision::Edited);
    assert!(matches!(config.validate(), Err(Error::Configuration(_))));

    let config = OrchestratorConfig::new().with_worker_timeout(Duration::ZERO);
    assert!(config.validate().is_err());
}

#[tokio::test]
async fn test_run_completes_and_learns_plan() {
    let worker = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![
        ("browse", worker.clone() as Arc<dyn Worker>),
        ("read-files", worker.clone() as Arc<dyn Worker>),
        ("execute-code", worker.clone() as Arc<dyn Worker>),
    ])
    .await;
    let orch = orchestrator(Arc::new(StaticPlanGenerator::new(THREE_STEPS)), registry, config());

    let outcome = orch
        .run("plot the report totals", BTreeMap::new())
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(worker.calls(), 3);
    let plan = outcome.session.plan.as_ref().unwrap();
    assert!(plan.steps.iter().all(|s| s.status == StepStatus::Succeeded));
    assert_eq!(
        plan.steps[1].result.as_ref().unwrap().text,
        "done: read report.csv"
    );
    assert_eq!(plan.steps[0].worker.as_ref().unwrap().identity, "browse-1");

    let record_id = outcome.learned_record.unwrap();
    let records = orch.memory().list().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, record_id);
    assert_eq!(records[0].outcome, OutcomeQuality::Clean);
    assert_eq!(records[0].steps[2], StepTemplate::new("execute-code", "plot the totals"));

    let stored = orch.session(outcome.session_id()).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Completed);
    assert_eq!(orch.cancellations.active_count(), 0);
}

#[tokio::test]
async fn test_second_run_is_seeded_from_memory() {
    let worker: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("browse", worker)]).await;

    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .withf(|request| request.seed.is_none())
        .times(1)
        .returning(|_| Ok("browse: open the status page".to_string()));
    planner
        .expect_generate_plan()
        .withf(|request| {
            request
                .seed
                .as_ref()
                .is_some_and(|seed| seed[0].instruction == "open the status page")
        })
        .times(1)
        .returning(|request| {
            Ok(crate::plan_text::render_plan_text(
                request.seed.as_deref().unwrap_or_default(),
            ))
        });

    let orch = orchestrator(Arc::new(planner), registry, config());
    let first = orch.run("check service status", BTreeMap::new()).await.unwrap();
    assert!(first.is_completed());

    let second = orch.run("check service status", BTreeMap::new()).await.unwrap();
    assert!(second.is_completed());
    let plan = second.session.plan.as_ref().unwrap();
    let digest = PlanMemory::fingerprint("check service status", &BTreeMap::new()).digest;
    assert_eq!(plan.seeded_from.as_deref(), Some(digest.as_str()));
}

#[tokio::test]
async fn test_unroutable_step_exhausts_replans() {
    let registry = Arc::new(WorkerRegistry::new());
    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .times(2)
        .returning(|_| Ok("read-files: list files in /data".to_string()));

    let orch = orchestrator(
        Arc::new(planner),
        registry,
        config().with_max_replans(1),
    );
    let outcome = orch.run("list files in /data", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    assert_eq!(
        outcome.failure(),
        Some(&FailureKind::ReplanBudgetExhausted { replans: 1 })
    );
    assert_eq!(outcome.session.replan_count, 1);
    let step = &outcome.session.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 0);
    assert!(matches!(
        step.last_failure,
        Some(FailureKind::UnroutableStep { ref capability }) if capability == "read-files"
    ));
    assert!(outcome.learned_record.is_none());
}

#[tokio::test]
async fn test_step_retried_within_limit() {
    let flaky = Arc::new(ScriptedWorker::failing_times(2));
    let steady: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![
        ("browse", steady.clone()),
        ("read-files", flaky.clone() as Arc<dyn Worker>),
        ("execute-code", steady),
    ])
    .await;
    let orch = orchestrator(Arc::new(StaticPlanGenerator::new(THREE_STEPS)), registry, config());

    let outcome = orch.run("plot the report totals", BTreeMap::new()).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(flaky.calls(), 3);
    let plan = outcome.session.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].attempts, 3);
    assert_eq!(plan.steps[0].attempts, 1);
    assert_eq!(outcome.session.replan_count, 0);

    let records = orch.memory().list().await.unwrap();
    assert_eq!(records[0].outcome, OutcomeQuality::Recovered);
}

#[tokio::test]
async fn test_retry_exhaustion_routes_to_replanning() {
    let flaky = Arc::new(ScriptedWorker::failing_times(10));
    let registry = registry_with(vec![("browse", flaky.clone() as Arc<dyn Worker>)]).await;
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: open the dashboard")),
        registry,
        config().with_max_step_retries(1).with_max_replans(0),
    );

    let outcome = orch.run("open the dashboard", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    assert_eq!(
        outcome.failure(),
        Some(&FailureKind::ReplanBudgetExhausted { replans: 0 })
    );
    assert_eq!(flaky.calls(), 2);
    assert_eq!(outcome.session.planning_notes.len(), 1);
    assert!(outcome.session.planning_notes[0].contains("2 attempt(s)"));
}

#[tokio::test]
async fn test_replan_keeps_completed_prefix() {
    let steady: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let broken = Arc::new(ScriptedWorker::failing_times(1));
    let registry = registry_with(vec![
        ("browse", steady.clone()),
        ("read-files", broken.clone() as Arc<dyn Worker>),
        ("execute-code", steady),
    ])
    .await;

    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .withf(|request| request.completed.is_empty())
        .times(1)
        .returning(|_| Ok("browse: open the dashboard\nread-files: read report.csv".to_string()));
    planner
        .expect_generate_plan()
        .withf(|request| request.completed.len() == 1 && request.prior_context.len() == 1)
        .times(1)
        .returning(|_| Ok("execute-code: read report.csv with pandas".to_string()));

    let orch = orchestrator(
        Arc::new(planner),
        registry,
        config().with_max_step_retries(0),
    );
    let outcome = orch.run("summarize the report", BTreeMap::new()).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.session.replan_count, 1);
    let plan = outcome.session.plan.as_ref().unwrap();
    assert_eq!(plan.version, 2);
    assert_eq!(plan.steps.len(), 2);
    assert_eq!(plan.steps[0].capability, "browse");
    assert_eq!(plan.steps[1].capability, "execute-code");
    assert_eq!(outcome.session.plan_history.len(), 1);
    assert_eq!(plan.previous, Some(outcome.session.plan_history[0].id));
}

#[tokio::test]
async fn test_plan_rejected_on_timeout_consumes_budget() {
    let registry = Arc::new(WorkerRegistry::new());
    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .times(2)
        .returning(|_| Ok("browse: open the dashboard".to_string()));

    let orch = orchestrator(
        Arc::new(planner),
        registry,
        config()
            .with_checkpoint_timeout(Duration::from_millis(5), Decision::Rejected)
            .with_max_replans(1),
    );
    let outcome = orch.run("open the dashboard", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    assert_eq!(outcome.session.checkpoints.len(), 2);
    assert!(outcome
        .session
        .log
        .iter()
        .any(|n| n.failure == Some(FailureKind::CheckpointTimeout)));
}

#[tokio::test]
async fn test_plan_generation_failure_fails_session() {
    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .times(3)
        .returning(|_| Err(WorkerFailure::new("model unavailable")));

    let orch = orchestrator(Arc::new(planner), Arc::new(WorkerRegistry::new()), config());
    let outcome = orch.run("anything", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    assert!(matches!(
        outcome.failure(),
        Some(FailureKind::WorkerError { message, .. }) if message == "model unavailable"
    ));
}

#[tokio::test]
async fn test_plan_generation_timeout() {
    let orch = orchestrator(
        Arc::new(StalledPlanner::default()),
        Arc::new(WorkerRegistry::new()),
        config()
            .with_plan_timeout(Duration::from_millis(10))
            .with_max_step_retries(0),
    );
    let outcome = orch.run("anything", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    assert_eq!(
        outcome.failure(),
        Some(&FailureKind::WorkerTimeout { after_ms: 10 })
    );
}

#[tokio::test]
async fn test_worker_timeout_is_retried() {
    let registry = registry_with(vec![("browse", Arc::new(BlockingWorker) as Arc<dyn Worker>)]).await;
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: wait forever")),
        registry,
        config()
            .with_worker_timeout(Duration::from_millis(10))
            .with_max_step_retries(1)
            .with_max_replans(0),
    );
    let outcome = orch.run("wait", BTreeMap::new()).await.unwrap();

    assert_eq!(outcome.state(), SessionState::Failed);
    let step = &outcome.session.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.attempts, 2);
    assert_eq!(
        step.last_failure,
        Some(FailureKind::WorkerTimeout { after_ms: 10 })
    );
}

#[tokio::test]
async fn test_flagged_step_rejected_triggers_replan() {
    let worker: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("mail", worker)]).await;
    let mut planner = MockPlanGenerator::new();
    planner
        .expect_generate_plan()
        .times(2)
        .returning(|_| Ok("mail: send email to the team".to_string()));

    let orch = orchestrator(
        Arc::new(planner),
        registry,
        config()
            .with_max_replans(1)
            .with_checkpoint_timeout(Duration::from_secs(5), Decision::Approved),
    )
    .with_policy(OversightPolicy::permissive().with_review_capability("mail"));
    let bus = Arc::new(EventBus::new(64));
    let orch = Arc::new(orch.with_event_bus(bus.clone()));
    let mut rx = bus.subscribe();

    let (session_id, handle) = orch
        .spawn_run("notify the team", BTreeMap::new())
        .await
        .unwrap();

    // Approve plans, reject every step review
    let reviewer = {
        let orch = orch.clone();
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                match event {
                    SessionEvent::CheckpointRaised {
                        checkpoint_id,
                        subject,
                        ..
                    } => {
                        let decision = match subject {
                            crate::checkpoint::CheckpointSubject::Plan { .. } => Decision::Approved,
                            crate::checkpoint::CheckpointSubject::Step { .. } => Decision::Rejected,
                        };
                        submit_when_ready(&orch, checkpoint_id, decision, None).await;
                    }
                    SessionEvent::SessionFailed { .. } | SessionEvent::SessionCompleted { .. } => {
                        break
                    }
                    _ => {}
                }
            }
        })
    };

    let outcome = handle.await.unwrap().unwrap();
    reviewer.await.unwrap();

    assert_eq!(outcome.session_id(), session_id);
    assert_eq!(outcome.state(), SessionState::Failed);
    assert_eq!(outcome.session.replan_count, 1);
    assert!(outcome.session.planning_notes[0].contains("rejected by the reviewer"));
}

/// Submit once the gate has registered the checkpoint
async fn submit_when_ready(
    orch: &Orchestrator,
    checkpoint_id: uuid::Uuid,
    decision: Decision,
    edited: Option<String>,
) {
    for _ in 0..100 {
        match orch
            .submit_decision(checkpoint_id, decision, edited.clone())
            .await
        {
            Err(Error::Checkpoint(crate::checkpoint::CheckpointError::NotFound)) => {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            _ => return,
        }
    }
}

#[tokio::test]
async fn test_cancel_during_step() {
    let registry = registry_with(vec![("browse", Arc::new(BlockingWorker) as Arc<dyn Worker>)]).await;
    let bus = Arc::new(EventBus::new(64));
    let orch = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("browse: wait forever")),
            registry,
            config(),
        )
        .with_event_bus(bus.clone()),
    );
    let mut rx = bus.subscribe();

    let (session_id, handle) = orch.spawn_run("wait", BTreeMap::new()).await.unwrap();
    loop {
        if let SessionEvent::StepStarted { .. } = rx.recv().await.unwrap() {
            break;
        }
    }

    assert_eq!(orch.cancellations.active_count(), 1);

    // A second driver for the same session is refused
    assert!(matches!(
        orch.execute(session_id).await,
        Err(Error::InvalidState(_))
    ));

    assert!(orch.cancel(session_id).await.unwrap());
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state(), SessionState::Cancelled);
    assert_eq!(outcome.failure(), Some(&FailureKind::Cancelled));
    let step = &outcome.session.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Pending);
    assert_eq!(outcome.session.in_progress_count(), 0);
    assert!(outcome.learned_record.is_none());
    assert_eq!(orch.running_count(), 0);
    assert_eq!(orch.cancellations.active_count(), 0);

    // Idempotent once terminal
    assert!(!orch.cancel(session_id).await.unwrap());
}

#[tokio::test]
async fn test_cancel_stored_session() {
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: x")),
        Arc::new(WorkerRegistry::new()),
        config(),
    );
    let session_id = orch.start("later", BTreeMap::new()).await.unwrap();
    assert_eq!(orch.cancellations.active_count(), 0);

    assert!(orch.cancel(session_id).await.unwrap());
    let stored = orch.session(session_id).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::Cancelled);
    assert_eq!(orch.cancellations.active_count(), 0);

    let outcome = orch.resume(session_id).await.unwrap();
    assert_eq!(outcome.state(), SessionState::Cancelled);

    let missing = orch.cancel(uuid::Uuid::new_v4()).await;
    assert!(matches!(missing, Err(Error::SessionNotFound(_))));
}

#[tokio::test]
async fn test_resume_lost_step_without_extra_attempt() {
    let worker = Arc::new(ScriptedWorker::with_snapshot(serde_json::json!({"tab": 2})));
    let registry = registry_with(vec![("browse", worker.clone() as Arc<dyn Worker>)]).await;
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: unused")),
        registry,
        config(),
    );

    let mut session = Session::new("open two tabs", BTreeMap::new());
    session.install_plan(Plan::new(&[
        StepTemplate::new("browse", "open tab one"),
        StepTemplate::new("browse", "open tab two"),
    ]));
    if let Some(plan) = session.plan.as_mut() {
        plan.steps[0].status = StepStatus::Succeeded;
        plan.steps[0].attempts = 1;
        plan.steps[1].status = StepStatus::InProgress;
        plan.steps[1].attempts = 1;
    }
    session
        .worker_states
        .insert("browse".to_string(), serde_json::json!({"tab": 1}));
    session.state = SessionState::WaitingForStep;
    store::save_session(orch.store().as_ref(), &session).await.unwrap();

    let outcome = orch.resume(session.id).await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(worker.calls(), 1);
    let plan = outcome.session.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].attempts, 1);
    assert_eq!(
        *worker.restored.lock().unwrap(),
        vec![serde_json::json!({"tab": 1})]
    );
    assert_eq!(
        outcome.session.worker_states.get("browse"),
        Some(&serde_json::json!({"tab": 2}))
    );
}

#[tokio::test]
async fn test_unknown_session() {
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: x")),
        Arc::new(WorkerRegistry::new()),
        config(),
    );
    let result = orch.resume(uuid::Uuid::new_v4()).await;
    assert!(matches!(result, Err(Error::SessionNotFound(_))));
}

/// Next checkpoint raised on the bus
async fn next_checkpoint(
    rx: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
) -> (uuid::Uuid, crate::checkpoint::CheckpointSubject) {
    loop {
        if let SessionEvent::CheckpointRaised {
            checkpoint_id,
            subject,
            ..
        } = rx.recv().await.unwrap()
        {
            return (checkpoint_id, subject);
        }
    }
}

fn reviewed_config() -> OrchestratorConfig {
    config().with_checkpoint_timeout(Duration::from_secs(5), Decision::Approved)
}

#[tokio::test]
async fn test_cancel_races_resume_of_stored_session() {
    let worker = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("browse", worker.clone() as Arc<dyn Worker>)]).await;

    let mut session = Session::new("open three tabs", BTreeMap::new());
    session.install_plan(Plan::new(&[
        StepTemplate::new("browse", "open tab one"),
        StepTemplate::new("browse", "open tab two"),
        StepTemplate::new("browse", "open tab three"),
    ]));
    session.state = SessionState::Delegating;
    let inner = MemoryStore::new();
    store::save_session(&inner, &session).await.unwrap();
    let gated = Arc::new(GatedStore::new(inner, session.id));

    let orch = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("browse: unused")),
            registry,
            config(),
        )
        .with_store(gated.clone()),
    );

    // Cancel parks while reading the stored session
    let canceller = {
        let orch = orch.clone();
        let session_id = session.id;
        tokio::spawn(async move { orch.cancel(session_id).await })
    };
    gated.entered.notified().await;

    // A resume in that window cannot pick the session up
    assert!(matches!(
        orch.resume(session.id).await,
        Err(Error::InvalidState(_))
    ));

    gated.release.notify_one();
    assert!(canceller.await.unwrap().unwrap());

    let outcome = orch.resume(session.id).await.unwrap();
    assert_eq!(outcome.state(), SessionState::Cancelled);
    assert_eq!(worker.calls(), 0);
    assert!(outcome.learned_record.is_none());
    assert!(orch.memory().list().await.unwrap().is_empty());
    assert_eq!(orch.cancellations.active_count(), 0);
}

#[tokio::test]
async fn test_cancel_during_plan_generation() {
    let planner = Arc::new(StalledPlanner::default());
    let worker = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("browse", worker.clone() as Arc<dyn Worker>)]).await;
    let orch = Arc::new(orchestrator(planner.clone(), registry, config()));

    let (session_id, handle) = orch.spawn_run("anything", BTreeMap::new()).await.unwrap();
    planner.asked.notified().await;

    assert!(orch.cancel(session_id).await.unwrap());
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state(), SessionState::Cancelled);
    assert_eq!(outcome.failure(), Some(&FailureKind::Cancelled));
    assert_eq!(worker.calls(), 0);
    assert!(outcome.learned_record.is_none());
}

#[tokio::test]
async fn test_cancel_while_plan_awaits_approval() {
    let worker = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("browse", worker.clone() as Arc<dyn Worker>)]).await;
    let bus = Arc::new(EventBus::new(64));
    let orch = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("browse: open the dashboard")),
            registry,
            reviewed_config(),
        )
        .with_event_bus(bus.clone()),
    );
    let mut rx = bus.subscribe();

    let (session_id, handle) = orch.spawn_run("open the dashboard", BTreeMap::new()).await.unwrap();
    let (checkpoint_id, _) = next_checkpoint(&mut rx).await;

    assert!(orch.cancel(session_id).await.unwrap());
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state(), SessionState::Cancelled);
    assert_eq!(worker.calls(), 0);
    assert!(outcome.session.pending_checkpoint.is_none());
    let checkpoint = outcome.session.checkpoints.last().unwrap();
    assert_eq!(checkpoint.id, checkpoint_id);
    assert_eq!(checkpoint.decision, Decision::Rejected);
    assert_eq!(checkpoint.resolution, Some(crate::checkpoint::Resolution::Cancellation));

    // Too late to answer
    assert!(orch
        .submit_decision(checkpoint_id, Decision::Approved, None)
        .await
        .is_err());
}

#[tokio::test]
async fn test_cancel_while_step_awaits_review() {
    let worker = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![
        ("mail", worker.clone() as Arc<dyn Worker>),
        ("browse", worker.clone() as Arc<dyn Worker>),
    ])
    .await;
    let bus = Arc::new(EventBus::new(64));
    let orch = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new(
                "mail: send email to the team\nbrowse: open the archive",
            )),
            registry,
            reviewed_config(),
        )
        .with_policy(OversightPolicy::permissive().with_review_capability("mail"))
        .with_event_bus(bus.clone()),
    );
    let mut rx = bus.subscribe();

    let (session_id, handle) = orch.spawn_run("notify the team", BTreeMap::new()).await.unwrap();
    let (plan_checkpoint, _) = next_checkpoint(&mut rx).await;
    submit_when_ready(&orch, plan_checkpoint, Decision::Approved, None).await;

    let (_, subject) = next_checkpoint(&mut rx).await;
    assert!(matches!(subject, crate::checkpoint::CheckpointSubject::Step { .. }));
    assert!(orch.cancel(session_id).await.unwrap());
    let outcome = handle.await.unwrap().unwrap();

    assert_eq!(outcome.state(), SessionState::Cancelled);
    assert_eq!(worker.calls(), 1);
    let plan = outcome.session.plan.as_ref().unwrap();
    assert_eq!(plan.steps[1].status, StepStatus::Pending);
    assert!(outcome.learned_record.is_none());
}

#[tokio::test]
async fn test_step_review_edit_replaces_result() {
    let worker: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("mail", worker)]).await;
    let bus = Arc::new(EventBus::new(64));
    let orch = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("mail: send email to the team")),
            registry,
            reviewed_config(),
        )
        .with_policy(OversightPolicy::permissive().with_review_capability("mail"))
        .with_event_bus(bus.clone()),
    );
    let mut rx = bus.subscribe();

    let (_, handle) = orch.spawn_run("notify the team", BTreeMap::new()).await.unwrap();
    let (plan_checkpoint, _) = next_checkpoint(&mut rx).await;
    submit_when_ready(&orch, plan_checkpoint, Decision::Approved, None).await;
    let (step_checkpoint, _) = next_checkpoint(&mut rx).await;
    submit_when_ready(
        &orch,
        step_checkpoint,
        Decision::Edited,
        Some("sent to the team list".to_string()),
    )
    .await;

    let outcome = handle.await.unwrap().unwrap();
    assert!(outcome.is_completed());
    let step = &outcome.session.plan.as_ref().unwrap().steps[0];
    assert_eq!(step.status, StepStatus::Succeeded);
    assert_eq!(step.result.as_ref().unwrap().text, "sent to the team list");
    assert!(outcome
        .session
        .log
        .iter()
        .any(|n| n.text.contains("result edited by reviewer")));
}

#[tokio::test]
async fn test_resume_reraises_stored_plan_checkpoint() {
    let worker: Arc<dyn Worker> = Arc::new(ScriptedWorker::default());
    let registry = registry_with(vec![("browse", worker)]).await;
    let first_bus = Arc::new(EventBus::new(64));
    let first = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("browse: open the dashboard")),
            registry.clone(),
            reviewed_config(),
        )
        .with_event_bus(first_bus.clone()),
    );
    let mut first_rx = first_bus.subscribe();

    let (session_id, handle) = first.spawn_run("open the dashboard", BTreeMap::new()).await.unwrap();
    let (raised, _) = next_checkpoint(&mut first_rx).await;

    // The driving process goes away while the checkpoint waits
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());
    let stored = first.session(session_id).await.unwrap().unwrap();
    assert_eq!(stored.state, SessionState::AwaitingPlanApproval);
    assert_eq!(stored.pending_checkpoint.as_ref().map(|c| c.id), Some(raised));

    let second_bus = Arc::new(EventBus::new(64));
    let second = Arc::new(
        orchestrator(
            Arc::new(StaticPlanGenerator::new("browse: unused")),
            registry,
            reviewed_config(),
        )
        .with_store(first.store().clone())
        .with_event_bus(second_bus.clone()),
    );
    let mut second_rx = second_bus.subscribe();

    let resumed = {
        let second = second.clone();
        tokio::spawn(async move { second.resume(session_id).await })
    };
    let (reraised, _) = next_checkpoint(&mut second_rx).await;
    assert_eq!(reraised, raised);
    submit_when_ready(&second, reraised, Decision::Approved, None).await;

    let outcome = resumed.await.unwrap().unwrap();
    assert!(outcome.is_completed());
    assert_eq!(outcome.session.checkpoints.len(), 1);
    assert_eq!(outcome.session.checkpoints[0].id, raised);
    assert_eq!(outcome.session.checkpoints[0].decision, Decision::Approved);
}

#[tokio::test]
async fn test_invalid_config_refused_before_driving() {
    let orch = orchestrator(
        Arc::new(StaticPlanGenerator::new("browse: x")),
        Arc::new(WorkerRegistry::new()),
        config().with_checkpoint_timeout(Duration::from_secs(1), Decision::Edited),
    );

    let result = orch.run("anything", BTreeMap::new()).await;
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert!(orch.sessions().await.unwrap().is_empty());

    let session = Session::new("stored", BTreeMap::new());
    store::save_session(orch.store().as_ref(), &session).await.unwrap();
    let result = orch.resume(session.id).await;
    assert!(matches!(result, Err(Error::Configuration(_))));
    assert_eq!(orch.running_count(), 0);
}
