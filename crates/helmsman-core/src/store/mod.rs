//! Session State Store
//!
//! Durable key/blob storage for sessions and registry bindings. Backends
//! store opaque JSON strings; the typed helpers here own (de)serialization.
//!
//! - [`MemoryStore`]: process-local, lost on restart (tests, `--ephemeral`)
//! - [`SqliteStore`]: single-file SQLite with WAL, the default
//!
//! Writes for the same key are last-writer-wins. A single session is only
//! ever written by the one engine task driving it.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{default_data_dir, SessionBackend, SessionBackendConfig, SqliteStore};

use crate::error::Result;
use crate::session::{session_key, Session, SESSION_KEY_PREFIX};
use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

/// Key/blob store abstraction over storage backends
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Upsert a blob
    async fn save(&self, key: &str, blob: &str) -> Result<()>;

    /// Load a blob
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// Delete a blob; `true` if something was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Check if a key exists
    async fn exists(&self, key: &str) -> Result<bool>;

    /// All stored keys
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// Number of stored blobs
    async fn count(&self) -> Result<usize>;
}

/// Serialize and save a session under its key
pub async fn save_session(store: &dyn SessionStore, session: &Session) -> Result<()> {
    let blob = serde_json::to_string(session)?;
    store.save(&session.key(), &blob).await?;
    debug!(session_id = %session.id, state = %session.state, "Session saved");
    Ok(())
}

/// Load a session by id
pub async fn load_session(store: &dyn SessionStore, id: Uuid) -> Result<Option<Session>> {
    match store.load(&session_key(id)).await? {
        Some(blob) => Ok(Some(serde_json::from_str(&blob)?)),
        None => Ok(None),
    }
}

/// Every stored session, most recently updated first
pub async fn list_sessions(store: &dyn SessionStore) -> Result<Vec<Session>> {
    let mut sessions = Vec::new();
    for key in store.list_keys().await? {
        if !key.starts_with(SESSION_KEY_PREFIX) {
            continue;
        }
        if let Some(blob) = store.load(&key).await? {
            sessions.push(serde_json::from_str::<Session>(&blob)?);
        }
    }
    sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    Ok(sessions)
}

#[cfg(test)]
mod tests;
