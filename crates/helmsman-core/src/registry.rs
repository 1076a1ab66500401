//! Worker Registry
//!
//! Maps capability tags to worker handles. Registration is last-writer-wins:
//! registering a tag again replaces the previous handle. When a store is
//! attached, the current tag bindings and a bounded journal of registry
//! changes are persisted under [`REGISTRY_KEY`] after every change.

use crate::error::Result;
use crate::session::{StepOutput, WorkerBinding};
use crate::store::SessionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Store key for persisted registry bindings
pub const REGISTRY_KEY: &str = "registry:bindings";

/// Registry events kept in the persisted journal
const JOURNAL_CAP: usize = 64;

/// Failure reported by a worker or plan generator
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct WorkerFailure {
    /// What went wrong
    pub message: String,
    /// Structured detail, if the worker provided any
    pub payload: Option<serde_json::Value>,
}

impl WorkerFailure {
    /// Failure with a message only
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            payload: None,
        }
    }

    /// Attach a structured payload
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A capability-specific executor.
///
/// `invoke` receives a child of the session's cancellation token and should
/// stop promptly once it fires. State hooks default to stateless no-ops.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute one instruction
    async fn invoke(
        &self,
        instruction: &str,
        cancel: CancellationToken,
    ) -> std::result::Result<StepOutput, WorkerFailure>;

    /// Capture resumable state after a successful step
    async fn snapshot_state(&self) -> std::result::Result<serde_json::Value, WorkerFailure> {
        Ok(serde_json::Value::Null)
    }

    /// Restore state captured by `snapshot_state`
    async fn restore_state(
        &self,
        _state: serde_json::Value,
    ) -> std::result::Result<(), WorkerFailure> {
        Ok(())
    }

    /// Drop all accumulated state
    async fn reset(&self) -> std::result::Result<(), WorkerFailure> {
        Ok(())
    }
}

/// A registered worker plus its routing metadata
#[derive(Clone)]
pub struct WorkerHandle {
    capability: String,
    identity: String,
    healthy: Arc<AtomicBool>,
    worker: Arc<dyn Worker>,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("capability", &self.capability)
            .field("identity", &self.identity)
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Wrap a worker. The capability tag is (re)bound on registration.
    #[must_use]
    pub fn new(identity: impl Into<String>, worker: Arc<dyn Worker>) -> Self {
        Self {
            capability: String::new(),
            identity: identity.into(),
            healthy: Arc::new(AtomicBool::new(true)),
            worker,
        }
    }

    /// Tag the handle is registered under
    #[must_use]
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Identity of the worker
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Advisory health flag; routing does not consult it
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Update the health flag
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// Routing binding for step records
    #[must_use]
    pub fn binding(&self) -> WorkerBinding {
        WorkerBinding {
            capability: self.capability.clone(),
            identity: self.identity.clone(),
        }
    }

    /// The underlying worker
    #[must_use]
    pub fn worker(&self) -> &Arc<dyn Worker> {
        &self.worker
    }
}

/// What happened to a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryEventKind {
    /// A handle was bound (or rebound) to a tag
    Registered,
    /// A tag was unbound
    Deregistered,
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEvent {
    /// When it happened
    pub at: DateTime<Utc>,
    /// Kind of change
    pub kind: RegistryEventKind,
    /// Binding affected
    pub binding: WorkerBinding,
}

/// Persisted form of the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedRegistry {
    /// Current bindings, sorted by tag
    pub bindings: Vec<WorkerBinding>,
    /// Recent changes, oldest first
    pub journal: Vec<RegistryEvent>,
}

/// Capability tag → worker handle directory
#[derive(Default)]
pub struct WorkerRegistry {
    handles: DashMap<String, WorkerHandle>,
    store: Option<Arc<dyn SessionStore>>,
    journal: Mutex<VecDeque<RegistryEvent>>,
}

impl WorkerRegistry {
    /// Create an unpersisted registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist bindings to `store` after every change
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Bind `handle` to `tag`, returning the handle it replaced
    pub async fn register(
        &self,
        tag: impl Into<String>,
        mut handle: WorkerHandle,
    ) -> Result<Option<WorkerHandle>> {
        let tag = tag.into();
        handle.capability = tag.clone();
        let binding = handle.binding();
        let previous = self.handles.insert(tag.clone(), handle);
        match &previous {
            Some(old) => info!(
                capability = %tag,
                identity = %binding.identity,
                replaced = %old.identity,
                "Worker rebound"
            ),
            None => info!(capability = %tag, identity = %binding.identity, "Worker registered"),
        }
        self.record(RegistryEventKind::Registered, binding).await?;
        Ok(previous)
    }

    /// Handle currently bound to `tag`
    #[must_use]
    pub fn resolve(&self, tag: &str) -> Option<WorkerHandle> {
        self.handles.get(tag).map(|h| h.clone())
    }

    /// Remove the binding for `tag`
    pub async fn deregister(&self, tag: &str) -> Result<Option<WorkerHandle>> {
        let removed = self.handles.remove(tag).map(|(_, handle)| handle);
        if let Some(handle) = &removed {
            info!(capability = %tag, identity = %handle.identity, "Worker deregistered");
            self.record(RegistryEventKind::Deregistered, handle.binding())
                .await?;
        }
        Ok(removed)
    }

    /// Registered tags, sorted
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        tags.sort();
        tags
    }

    /// Number of bound tags
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether no tag is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Bindings as last persisted (empty without a store)
    pub async fn persisted_bindings(&self) -> Result<PersistedRegistry> {
        let Some(store) = &self.store else {
            return Ok(PersistedRegistry::default());
        };
        match store.load(REGISTRY_KEY).await? {
            Some(blob) => Ok(serde_json::from_str(&blob)?),
            None => Ok(PersistedRegistry::default()),
        }
    }

    /// Reset every registered worker. Failures are logged and returned.
    pub async fn reset_all(&self) -> Vec<(String, WorkerFailure)> {
        let handles: Vec<WorkerHandle> = self.handles.iter().map(|e| e.value().clone()).collect();
        let mut failures = Vec::new();
        for handle in handles {
            if let Err(e) = handle.worker.reset().await {
                warn!(capability = %handle.capability, error = %e, "Worker reset failed");
                failures.push((handle.capability.clone(), e));
            }
        }
        failures
    }

    async fn record(&self, kind: RegistryEventKind, binding: WorkerBinding) -> Result<()> {
        let mut journal = self.journal.lock().await;
        journal.push_back(RegistryEvent {
            at: Utc::now(),
            kind,
            binding,
        });
        while journal.len() > JOURNAL_CAP {
            journal.pop_front();
        }

        let Some(store) = &self.store else {
            return Ok(());
        };
        let mut bindings: Vec<WorkerBinding> =
            self.handles.iter().map(|e| e.value().binding()).collect();
        bindings.sort_by(|a, b| a.capability.cmp(&b.capability));
        let snapshot = PersistedRegistry {
            bindings,
            journal: journal.iter().cloned().collect(),
        };
        store
            .save(REGISTRY_KEY, &serde_json::to_string(&snapshot)?)
            .await?;
        debug!(bindings = snapshot.bindings.len(), "Registry bindings persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests;
