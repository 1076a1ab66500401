//! Application configuration
//!
//! Loaded from the embedded `config/default.toml`, optional files under
//! `config/`, and `HELMSMAN_*` environment variables, in that order.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use helmsman_core::{
    Decision, OrchestratorConfig, OversightConfig, PlanMemoryConfig, SessionBackendConfig,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorAppConfig,
    #[serde(default)]
    pub sessions: SessionBackendConfig,
    #[serde(default)]
    pub memory: MemoryAppConfig,
    #[serde(default)]
    pub oversight: OversightConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable logs
    #[serde(default)]
    pub json: bool,
}

/// Orchestrator budgets (exposed to TOML)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorAppConfig {
    #[serde(default = "default_retries")]
    pub max_step_retries: u32,
    #[serde(default = "default_retries")]
    pub max_replans: u32,
    #[serde(default = "default_retries")]
    pub max_edit_rounds: u32,
    #[serde(default = "default_call_timeout")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_call_timeout")]
    pub plan_timeout_secs: u64,
    #[serde(default = "default_checkpoint_timeout")]
    pub checkpoint_timeout_secs: u64,
    #[serde(default = "default_checkpoint_decision")]
    pub checkpoint_default: String,
    #[serde(default = "default_true")]
    pub learn_plans: bool,
}

fn default_retries() -> u32 {
    2
}

fn default_call_timeout() -> u64 {
    120
}

fn default_checkpoint_timeout() -> u64 {
    600
}

fn default_checkpoint_decision() -> String {
    "rejected".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorAppConfig {
    fn default() -> Self {
        Self {
            max_step_retries: default_retries(),
            max_replans: default_retries(),
            max_edit_rounds: default_retries(),
            worker_timeout_secs: default_call_timeout(),
            plan_timeout_secs: default_call_timeout(),
            checkpoint_timeout_secs: default_checkpoint_timeout(),
            checkpoint_default: default_checkpoint_decision(),
            learn_plans: true,
        }
    }
}

impl OrchestratorAppConfig {
    /// Convert to the engine's configuration, validating it on the way
    pub fn to_engine_config(&self) -> Result<OrchestratorConfig> {
        let default = match Decision::parse(&self.checkpoint_default) {
            Some(decision @ (Decision::Approved | Decision::Rejected)) => decision,
            _ => bail!(
                "orchestrator.checkpoint_default must be \"approved\" or \"rejected\", got {:?}",
                self.checkpoint_default
            ),
        };
        let config = OrchestratorConfig::new()
            .with_max_step_retries(self.max_step_retries)
            .with_max_replans(self.max_replans)
            .with_max_edit_rounds(self.max_edit_rounds)
            .with_worker_timeout(Duration::from_secs(self.worker_timeout_secs))
            .with_plan_timeout(Duration::from_secs(self.plan_timeout_secs))
            .with_checkpoint_timeout(Duration::from_secs(self.checkpoint_timeout_secs), default)
            .with_learning(self.learn_plans);
        config.validate()?;
        Ok(config)
    }
}

/// Plan memory file and tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryAppConfig {
    #[serde(default = "default_memory_path")]
    pub path: String,
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_memory_path() -> String {
    "plans.db".to_string()
}

fn default_similarity_threshold() -> f32 {
    PlanMemoryConfig::default().similarity_threshold
}

fn default_history_cap() -> usize {
    PlanMemoryConfig::default().history_cap
}

impl Default for MemoryAppConfig {
    fn default() -> Self {
        Self {
            path: default_memory_path(),
            similarity_threshold: default_similarity_threshold(),
            history_cap: default_history_cap(),
        }
    }
}

impl MemoryAppConfig {
    /// Retrieval tuning for [`helmsman_core::PlanMemory`]
    #[must_use]
    pub fn tuning(&self) -> PlanMemoryConfig {
        PlanMemoryConfig::default()
            .with_similarity_threshold(self.similarity_threshold)
            .with_history_cap(self.history_cap)
    }
}

/// External plan generator command
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One command-line worker bound to a capability tag
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub capability: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Identity recorded on steps (defaults to the command)
    #[serde(default)]
    pub identity: Option<String>,
}

impl AppConfig {
    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) if !dir.trim().is_empty() => Ok(PathBuf::from(dir)),
            _ => Ok(helmsman_core::default_data_dir()?),
        }
    }
}

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let config = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            File::with_name(&format!(
                "config/{}",
                std::env::var("HELMSMAN_ENV").unwrap_or_else(|_| "development".to_string())
            ))
            .required(false),
        )
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority)
        // prefix_separator("_") makes HELMSMAN_ORCHESTRATOR__X work.
        .add_source(
            Environment::with_prefix("HELMSMAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedded() -> AppConfig {
        Config::builder()
            .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_embedded_defaults_parse() {
        let config = embedded();
        assert_eq!(config.orchestrator.max_replans, 2);
        assert_eq!(config.sessions.backend, "sqlite");
        assert_eq!(config.memory.path, "plans.db");
        assert!((config.memory.tuning().similarity_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.oversight.review_capabilities, vec!["human".to_string()]);
        assert!(!config.oversight.instruction_patterns.is_empty());
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_engine_config_conversion() {
        let engine = embedded().orchestrator.to_engine_config().unwrap();
        assert_eq!(engine.checkpoint_default, Decision::Rejected);
        assert_eq!(engine.worker_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_bad_checkpoint_default_rejected() {
        let mut config = OrchestratorAppConfig::default();
        config.checkpoint_default = "edited".to_string();
        assert!(config.to_engine_config().is_err());
    }
}
