//! SQLite blob store
//!
//! The default backend: one `state_blobs` table keyed by store key, written
//! with an upsert so each save replaces the previous blob atomically.

use super::{MemoryStore, SessionStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// SQLite-backed store
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Internal(format!("Failed to create database directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;

        info!(path = %path.display(), "SQLite session store initialized");
        Ok(store)
    }

    /// In-memory database (tests)
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS state_blobs (
                blob_key TEXT PRIMARY KEY,
                blob_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        debug!("SQLite session schema initialized");
        Ok(())
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<bool> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(true)
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn save(&self, key: &str, blob: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"
            INSERT INTO state_blobs (blob_key, blob_data, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(blob_key) DO UPDATE SET
                blob_data = excluded.blob_data,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(blob)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT blob_data FROM state_blobs WHERE blob_key = ?")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(data,)| data))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM state_blobs WHERE blob_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT 1 FROM state_blobs WHERE blob_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT blob_key FROM state_blobs ORDER BY blob_key")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn count(&self) -> Result<usize> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM state_blobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 as usize)
    }
}

/// Session backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBackendConfig {
    /// Backend type: "sqlite" (default) or "memory"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// SQLite database path, relative to the data directory
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> String {
    "sessions.db".to_string()
}

impl Default for SessionBackendConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// Default data directory (`~/.helmsman`)
pub fn default_data_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Internal("Could not determine home directory".to_string()))?;
    Ok(home.join(".helmsman"))
}

/// Unified backend wrapping the concrete stores
pub enum SessionBackend {
    /// SQLite storage (default)
    Sqlite(SqliteStore),
    /// In-memory storage
    Memory(MemoryStore),
}

impl SessionBackend {
    /// Build a backend from configuration; relative paths resolve under `data_dir`
    pub async fn from_config(config: &SessionBackendConfig, data_dir: &Path) -> Result<Self> {
        match config.backend.as_str() {
            "sqlite" => {
                let path = data_dir.join(&config.sqlite_path);
                Ok(Self::Sqlite(SqliteStore::new(&path).await?))
            }
            "memory" => Ok(Self::Memory(MemoryStore::new())),
            other => Err(Error::Configuration(format!(
                "Unknown session backend: '{other}'. Use 'sqlite' or 'memory'."
            ))),
        }
    }

    /// Backend name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sqlite(_) => "sqlite",
            Self::Memory(_) => "memory",
        }
    }
}

#[async_trait]
impl SessionStore for SessionBackend {
    async fn save(&self, key: &str, blob: &str) -> Result<()> {
        match self {
            Self::Sqlite(store) => store.save(key, blob).await,
            Self::Memory(store) => store.save(key, blob).await,
        }
    }

    async fn load(&self, key: &str) -> Result<Option<String>> {
        match self {
            Self::Sqlite(store) => store.load(key).await,
            Self::Memory(store) => store.load(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self {
            Self::Sqlite(store) => store.delete(key).await,
            Self::Memory(store) => store.delete(key).await,
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self {
            Self::Sqlite(store) => store.exists(key).await,
            Self::Memory(store) => store.exists(key).await,
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        match self {
            Self::Sqlite(store) => store.list_keys().await,
            Self::Memory(store) => store.list_keys().await,
        }
    }

    async fn count(&self) -> Result<usize> {
        match self {
            Self::Sqlite(store) => store.count().await,
            Self::Memory(store) => store.count().await,
        }
    }
}
