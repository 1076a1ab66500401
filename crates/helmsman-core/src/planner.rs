//! Plan generation seam
//!
//! The engine asks a [`PlanGenerator`] for plan text and parses it with
//! [`parse_plan_text`](crate::plan_text::parse_plan_text). Generators are
//! external collaborators (an LLM, a script, a file); the engine bounds
//! each call with a timeout and retries failures.

use crate::registry::WorkerFailure;
use async_trait::async_trait;
use helmsman_memory::StepTemplate;
use serde::Serialize;
use std::collections::BTreeMap;

/// Everything a generator may use to draft a plan
#[derive(Debug, Clone, Default, Serialize)]
pub struct PlanRequest {
    /// Session goal
    pub goal: String,
    /// Context fields supplied with the goal
    pub context: BTreeMap<String, String>,
    /// Failure reasons and rejections from earlier attempts, oldest first
    pub prior_context: Vec<String>,
    /// Steps already completed; the new plan continues after these
    pub completed: Vec<StepTemplate>,
    /// Remembered step sequence from a similar past goal
    pub seed: Option<Vec<StepTemplate>>,
    /// Capability tags currently registered
    pub capabilities: Vec<String>,
}

impl PlanRequest {
    /// Whether this request regenerates the tail of an existing plan
    #[must_use]
    pub fn is_replan(&self) -> bool {
        !self.prior_context.is_empty() || !self.completed.is_empty()
    }
}

/// Produces plan text for a goal
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlanGenerator: Send + Sync {
    /// Draft plan text (JSON or line format) for the request
    async fn generate_plan(&self, request: &PlanRequest) -> Result<String, WorkerFailure>;
}

/// Generator that always returns the same text
pub struct StaticPlanGenerator {
    text: String,
}

impl StaticPlanGenerator {
    /// Wrap fixed plan text
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl PlanGenerator for StaticPlanGenerator {
    async fn generate_plan(&self, _request: &PlanRequest) -> Result<String, WorkerFailure> {
        Ok(self.text.clone())
    }
}

/// Generator that replays the remembered seed, falling back to another
/// generator when there is none or when replanning.
pub struct SeededPlanGenerator<G> {
    fallback: G,
}

impl<G: PlanGenerator> SeededPlanGenerator<G> {
    /// Wrap a fallback generator
    #[must_use]
    pub fn new(fallback: G) -> Self {
        Self { fallback }
    }
}

#[async_trait]
impl<G: PlanGenerator> PlanGenerator for SeededPlanGenerator<G> {
    async fn generate_plan(&self, request: &PlanRequest) -> Result<String, WorkerFailure> {
        match &request.seed {
            Some(seed) if !request.is_replan() && !seed.is_empty() => {
                Ok(crate::plan_text::render_plan_text(seed))
            }
            _ => self.fallback.generate_plan(request).await,
        }
    }
}
