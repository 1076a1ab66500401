//! Record stores for learned plans.
//!
//! Records are append-only and bucketed by fingerprint digest. Each bucket
//! keeps a bounded history: appending past the cap evicts the oldest record
//! of that bucket only.

use crate::error::Result;
use crate::types::LearnedPlanRecord;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// Keyed append-only persistence for learned plan records
#[async_trait]
pub trait PlanRecordStore: Send + Sync {
    /// Append a record, evicting the oldest records of its bucket beyond `cap`.
    ///
    /// Returns the stored record with its assigned sequence number.
    async fn append(&self, record: LearnedPlanRecord, cap: usize) -> Result<LearnedPlanRecord>;

    /// All records stored under a digest, oldest first
    async fn bucket(&self, digest: &str) -> Result<Vec<LearnedPlanRecord>>;

    /// Every stored record, oldest first
    async fn all(&self) -> Result<Vec<LearnedPlanRecord>>;

    /// Total record count
    async fn count(&self) -> Result<usize>;
}

/// In-memory record store (tests and ephemeral runs)
#[derive(Default)]
pub struct InMemoryPlanStore {
    inner: RwLock<InMemoryState>,
}

#[derive(Default)]
struct InMemoryState {
    buckets: HashMap<String, VecDeque<LearnedPlanRecord>>,
    next_sequence: i64,
}

impl InMemoryPlanStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PlanRecordStore for InMemoryPlanStore {
    async fn append(&self, mut record: LearnedPlanRecord, cap: usize) -> Result<LearnedPlanRecord> {
        let mut state = self.inner.write().await;
        state.next_sequence += 1;
        record.sequence = state.next_sequence;

        let bucket = state
            .buckets
            .entry(record.fingerprint.digest.clone())
            .or_default();
        bucket.push_back(record.clone());

        let cap = cap.max(1);
        while bucket.len() > cap {
            if let Some(evicted) = bucket.pop_front() {
                debug!(record_id = %evicted.id, digest = %evicted.fingerprint, "Evicted oldest plan record");
            }
        }

        Ok(record)
    }

    async fn bucket(&self, digest: &str) -> Result<Vec<LearnedPlanRecord>> {
        let state = self.inner.read().await;
        Ok(state
            .buckets
            .get(digest)
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn all(&self) -> Result<Vec<LearnedPlanRecord>> {
        let state = self.inner.read().await;
        let mut records: Vec<LearnedPlanRecord> =
            state.buckets.values().flatten().cloned().collect();
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    async fn count(&self) -> Result<usize> {
        let state = self.inner.read().await;
        Ok(state.buckets.values().map(VecDeque::len).sum())
    }
}
