//! Engine assembly
//!
//! Builds the shared stores, the worker registry and the orchestrator from
//! [`AppConfig`].

use crate::adapters::{CommandPlanGenerator, CommandWorker, UnconfiguredPlanner};
use crate::config::AppConfig;
use anyhow::{Context, Result};
use helmsman_core::{
    EventBus, Orchestrator, OversightPolicy, PlanGenerator, PlanMemory, SeededPlanGenerator,
    SessionBackend, SessionStore, StaticPlanGenerator, WorkerHandle, WorkerRegistry,
};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a command needs to drive sessions
pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<EventBus>,
}

/// Open the configured session store
pub async fn open_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>> {
    let data_dir = config.data_dir()?;
    let backend = SessionBackend::from_config(&config.sessions, &data_dir)
        .await
        .context("Failed to open session store")?;
    info!(backend = backend.name(), dir = %data_dir.display(), "Session store ready");
    Ok(Arc::new(backend))
}

/// Open the plan memory database
pub async fn open_memory(config: &AppConfig) -> Result<Arc<PlanMemory>> {
    let path = config.data_dir()?.join(&config.memory.path);
    let memory = PlanMemory::from_path(&path, config.memory.tuning())
        .await
        .with_context(|| format!("Failed to open plan memory at {}", path.display()))?;
    Ok(Arc::new(memory))
}

/// Plan generator: a fixed plan file, or the configured command replaying
/// remembered plans when one matches
pub fn plan_generator(config: &AppConfig, plan_file: Option<&Path>) -> Result<Arc<dyn PlanGenerator>> {
    if let Some(path) = plan_file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file {}", path.display()))?;
        helmsman_core::parse_plan_text(&text)
            .with_context(|| format!("Plan file {} is not a valid plan", path.display()))?;
        return Ok(Arc::new(StaticPlanGenerator::new(text)));
    }

    let command = config.planner.command.trim();
    if command.is_empty() {
        warn!("No planner command configured; only remembered plans can be used");
        return Ok(Arc::new(SeededPlanGenerator::new(UnconfiguredPlanner)));
    }
    Ok(Arc::new(SeededPlanGenerator::new(CommandPlanGenerator::new(
        command,
        config.planner.args.clone(),
    ))))
}

/// Registry with every configured command worker bound
pub async fn build_registry(
    config: &AppConfig,
    store: Arc<dyn SessionStore>,
) -> Result<Arc<WorkerRegistry>> {
    let registry = WorkerRegistry::new().with_store(store);

    let previous = registry.persisted_bindings().await?;
    for binding in &previous.bindings {
        if !config
            .workers
            .iter()
            .any(|w| w.capability == binding.capability)
        {
            warn!(
                capability = %binding.capability,
                identity = %binding.identity,
                "Previously bound capability has no configured worker"
            );
        }
    }

    for worker in &config.workers {
        let identity = worker
            .identity
            .clone()
            .unwrap_or_else(|| worker.command.clone());
        let handle = WorkerHandle::new(
            identity,
            Arc::new(CommandWorker::new(&worker.command, worker.args.clone())),
        );
        registry.register(&worker.capability, handle).await?;
    }
    Ok(Arc::new(registry))
}

/// Assemble the orchestrator
pub async fn build(config: &AppConfig, plan_file: Option<&Path>) -> Result<Engine> {
    let store = open_store(config).await?;
    let memory = open_memory(config).await?;
    let registry = build_registry(config, store.clone()).await?;
    let planner = plan_generator(config, plan_file)?;
    let policy = OversightPolicy::from_config(&config.oversight)?;
    let bus = Arc::new(EventBus::default());

    let orchestrator = Orchestrator::new(planner, registry, config.orchestrator.to_engine_config()?)
        .with_store(store)
        .with_memory(memory)
        .with_policy(policy)
        .with_event_bus(bus.clone());

    Ok(Engine {
        orchestrator: Arc::new(orchestrator),
        bus,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use helmsman_core::{PlanRequest, SessionState};
    use std::collections::BTreeMap;

    fn config_in(dir: &Path) -> AppConfig {
        let mut config = AppConfig {
            data_dir: Some(dir.display().to_string()),
            ..AppConfig::default()
        };
        config.orchestrator.checkpoint_timeout_secs = 1;
        config.orchestrator.checkpoint_default = "approved".to_string();
        config
    }

    #[tokio::test]
    async fn test_plan_file_must_parse() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());

        let bad = dir.path().join("bad.plan");
        std::fs::write(&bad, "   \n").unwrap();
        assert!(plan_generator(&config, Some(&bad)).is_err());

        let good = dir.path().join("good.plan");
        std::fs::write(&good, "browse: open the docs\n").unwrap();
        let planner = plan_generator(&config, Some(&good)).unwrap();
        let text = planner.generate_plan(&PlanRequest::default()).await.unwrap();
        assert_eq!(text.trim(), "browse: open the docs");
    }

    #[tokio::test]
    async fn test_unconfigured_planner_fails() {
        let dir = tempfile::tempdir().unwrap();
        let planner = plan_generator(&config_in(dir.path()), None).unwrap();
        let failure = planner
            .generate_plan(&PlanRequest::default())
            .await
            .unwrap_err();
        assert!(failure.message.contains("no planner configured"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_build_runs_session_against_command_worker() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.workers.push(WorkerConfig {
            capability: "shell".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "tr a-z A-Z".to_string()],
            identity: Some("upper".to_string()),
        });
        let plan = dir.path().join("shout.plan");
        std::fs::write(&plan, "shell: make it loud\n").unwrap();

        let engine = build(&config, Some(&plan)).await.unwrap();
        let outcome = engine
            .orchestrator
            .run("shout the greeting", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(outcome.state(), SessionState::Completed);
        let step = &outcome.session.plan.as_ref().unwrap().steps[0];
        assert_eq!(step.result.as_ref().unwrap().text, "MAKE IT LOUD");
        assert_eq!(step.worker.as_ref().unwrap().identity, "upper");
        assert!(dir.path().join("sessions.db").exists());
        assert!(dir.path().join("plans.db").exists());
    }
}
