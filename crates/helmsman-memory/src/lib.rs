//! Helmsman Memory - learned plan retrieval
//!
//! Completed sessions are remembered as [`LearnedPlanRecord`]s indexed by a
//! task [`Fingerprint`]. New sessions look up the most similar record and use
//! its step sequence to seed their first plan draft.
//!
//! # Architecture
//!
//! ```text
//! goal + context ──► Fingerprint ──► PlanMemory::retrieve ──► ScoredRecord
//!                                          │
//!                                   PlanRecordStore
//!                                  ╱               ╲
//!                       InMemoryPlanStore     SqlitePlanStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod fingerprint;
pub mod sqlite;
pub mod store;
pub mod types;

pub use error::{Error, Result};
pub use fingerprint::Fingerprint;
pub use sqlite::SqlitePlanStore;
pub use store::{InMemoryPlanStore, PlanRecordStore};
pub use types::{LearnedPlanRecord, OutcomeQuality, ScoredRecord, StepTemplate};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Plan memory tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMemoryConfig {
    /// Minimum fingerprint similarity for a record to seed a plan
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,
    /// Records kept per fingerprint bucket before the oldest is evicted
    #[serde(default = "default_history_cap")]
    pub history_cap: usize,
}

fn default_similarity_threshold() -> f32 {
    0.6
}

fn default_history_cap() -> usize {
    5
}

impl Default for PlanMemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            history_cap: default_history_cap(),
        }
    }
}

impl PlanMemoryConfig {
    /// Set the acceptance threshold
    #[must_use]
    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    /// Set the per-bucket history cap
    #[must_use]
    pub fn with_history_cap(mut self, cap: usize) -> Self {
        self.history_cap = cap;
        self
    }
}

/// High-level facade over a record store.
///
/// Safe to share between sessions: appends to different fingerprint buckets
/// never interfere with each other.
pub struct PlanMemory {
    store: Arc<dyn PlanRecordStore>,
    config: PlanMemoryConfig,
}

impl PlanMemory {
    /// Wrap an existing store
    #[must_use]
    pub fn new(store: Arc<dyn PlanRecordStore>, config: PlanMemoryConfig) -> Self {
        Self { store, config }
    }

    /// Ephemeral memory backed by [`InMemoryPlanStore`]
    #[must_use]
    pub fn in_memory(config: PlanMemoryConfig) -> Self {
        Self::new(Arc::new(InMemoryPlanStore::new()), config)
    }

    /// Memory backed by an SQLite file
    pub async fn from_path(path: &Path, config: PlanMemoryConfig) -> Result<Self> {
        let store = SqlitePlanStore::from_path(path).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &PlanMemoryConfig {
        &self.config
    }

    /// Deterministic, order-insensitive digest of a goal and its context.
    #[must_use]
    pub fn fingerprint(goal: &str, context: &BTreeMap<String, String>) -> Fingerprint {
        Fingerprint::compute(goal, context)
    }

    /// Best-matching record at or above the similarity threshold.
    ///
    /// Ties on score go to the most recent record.
    pub async fn retrieve(&self, key: &Fingerprint) -> Result<Option<ScoredRecord>> {
        let records = self.store.all().await?;
        let threshold = self.config.similarity_threshold;

        let best = records
            .into_iter()
            .map(|record| {
                let score = key.similarity(&record.fingerprint);
                ScoredRecord { record, score }
            })
            .filter(|candidate| candidate.score >= threshold)
            .max_by(|a, b| {
                a.score
                    .total_cmp(&b.score)
                    .then(a.record.created_at.cmp(&b.record.created_at))
                    .then(a.record.sequence.cmp(&b.record.sequence))
            });

        match &best {
            Some(hit) => debug!(
                query = %key,
                record_id = %hit.record.id,
                score = hit.score,
                "Plan memory hit"
            ),
            None => debug!(query = %key, threshold, "No remembered plan above threshold"),
        }
        Ok(best)
    }

    /// Append a new record for `key`. Older records under the same key stay
    /// until the bucket's history cap is exceeded.
    pub async fn store(
        &self,
        key: Fingerprint,
        goal: impl Into<String>,
        steps: Vec<StepTemplate>,
        outcome: OutcomeQuality,
    ) -> Result<LearnedPlanRecord> {
        let record = LearnedPlanRecord::new(key, goal, steps, outcome);
        let stored = self.store.append(record, self.config.history_cap).await?;
        info!(
            record_id = %stored.id,
            fingerprint = %stored.fingerprint,
            steps = stored.steps.len(),
            outcome = %stored.outcome,
            "Learned plan stored"
        );
        Ok(stored)
    }

    /// Every stored record, oldest first
    pub async fn list(&self) -> Result<Vec<LearnedPlanRecord>> {
        self.store.all().await
    }

    /// Total number of stored records
    pub async fn count(&self) -> Result<usize> {
        self.store.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps(instructions: &[&str]) -> Vec<StepTemplate> {
        instructions
            .iter()
            .map(|i| StepTemplate::new("browse", *i))
            .collect()
    }

    #[tokio::test]
    async fn test_store_then_retrieve_round_trips() {
        let memory = PlanMemory::in_memory(PlanMemoryConfig::default());
        let key = PlanMemory::fingerprint("find the cheapest flight", &BTreeMap::new());
        let plan = vec![
            StepTemplate::new("browse", "search flights for next friday"),
            StepTemplate::new("execute-code", "sort results by price"),
        ];

        memory
            .store(key.clone(), "find the cheapest flight", plan.clone(), OutcomeQuality::Clean)
            .await
            .unwrap();

        let hit = memory.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(hit.record.steps, plan);
        assert!((hit.score - 1.0).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_retrieve_prefers_most_recent_on_tie() {
        let memory = PlanMemory::in_memory(PlanMemoryConfig::default());
        let key = PlanMemory::fingerprint("summarize inbox", &BTreeMap::new());

        memory
            .store(key.clone(), "summarize inbox", steps(&["old"]), OutcomeQuality::Clean)
            .await
            .unwrap();
        memory
            .store(key.clone(), "summarize inbox", steps(&["new"]), OutcomeQuality::Recovered)
            .await
            .unwrap();

        let hit = memory.retrieve(&key).await.unwrap().unwrap();
        assert_eq!(hit.record.steps[0].instruction, "new");
    }

    #[tokio::test]
    async fn test_retrieve_similar_goal_above_threshold() {
        let memory = PlanMemory::in_memory(PlanMemoryConfig::default().with_similarity_threshold(0.5));
        let stored_key = PlanMemory::fingerprint("list files in /data", &BTreeMap::new());
        memory
            .store(stored_key, "list files in /data", steps(&["ls"]), OutcomeQuality::Clean)
            .await
            .unwrap();

        let near = PlanMemory::fingerprint("list files in /tmp", &BTreeMap::new());
        assert!(memory.retrieve(&near).await.unwrap().is_some());

        let far = PlanMemory::fingerprint("book a restaurant", &BTreeMap::new());
        assert!(memory.retrieve(&far).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retrieve_empty_memory() {
        let memory = PlanMemory::in_memory(PlanMemoryConfig::default());
        let key = PlanMemory::fingerprint("anything", &BTreeMap::new());
        assert!(memory.retrieve(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_cap_applies() {
        let memory = PlanMemory::in_memory(PlanMemoryConfig::default().with_history_cap(2));
        let key = PlanMemory::fingerprint("rotate logs", &BTreeMap::new());
        for i in 0..5 {
            memory
                .store(key.clone(), "rotate logs", steps(&[format!("v{i}").as_str()]), OutcomeQuality::Clean)
                .await
                .unwrap();
        }
        assert_eq!(memory.count().await.unwrap(), 2);
    }
}
