use super::*;
use crate::session::{Session, SessionState};
use std::collections::BTreeMap;
use tempfile::TempDir;

async fn exercise_blob_store(store: &dyn SessionStore) {
    assert_eq!(store.count().await.unwrap(), 0);
    store.save("a", "{\"v\":1}").await.unwrap();
    store.save("a", "{\"v\":2}").await.unwrap();
    store.save("b", "{}").await.unwrap();

    assert_eq!(store.load("a").await.unwrap().as_deref(), Some("{\"v\":2}"));
    assert!(store.exists("b").await.unwrap());
    assert_eq!(store.count().await.unwrap(), 2);

    let mut keys = store.list_keys().await.unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a", "b"]);

    assert!(store.delete("a").await.unwrap());
    assert!(!store.delete("a").await.unwrap());
    assert!(store.load("a").await.unwrap().is_none());
}

#[tokio::test]
async fn test_memory_store() {
    exercise_blob_store(&MemoryStore::new()).await;
}

#[tokio::test]
async fn test_sqlite_store() {
    exercise_blob_store(&SqliteStore::in_memory().await.unwrap()).await;
}

#[tokio::test]
async fn test_session_helpers_round_trip() {
    let store = MemoryStore::new();
    let mut session = Session::new("tidy the inbox", BTreeMap::new());
    save_session(&store, &session).await.unwrap();

    session.state = SessionState::Delegating;
    save_session(&store, &session).await.unwrap();
    store.save("registry:bindings", "{}").await.unwrap();

    let loaded = load_session(&store, session.id).await.unwrap().unwrap();
    assert_eq!(loaded.state, SessionState::Delegating);

    let all = list_sessions(&store).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(load_session(&store, uuid::Uuid::new_v4())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_sqlite_survives_reopen() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("nested").join("sessions.db");
    let session = Session::new("persist me", BTreeMap::new());
    {
        let store = SqliteStore::new(&path).await.unwrap();
        save_session(&store, &session).await.unwrap();
        assert!(store.health_check().await.unwrap());
    }
    let reopened = SqliteStore::new(&path).await.unwrap();
    let loaded = load_session(&reopened, session.id).await.unwrap().unwrap();
    assert_eq!(loaded.goal, "persist me");
}

#[tokio::test]
async fn test_backend_from_config() {
    let temp = TempDir::new().unwrap();
    let backend = SessionBackend::from_config(&SessionBackendConfig::default(), temp.path())
        .await
        .unwrap();
    assert_eq!(backend.name(), "sqlite");
    exercise_blob_store(&backend).await;

    let memory = SessionBackendConfig {
        backend: "memory".to_string(),
        ..SessionBackendConfig::default()
    };
    let backend = SessionBackend::from_config(&memory, temp.path()).await.unwrap();
    assert_eq!(backend.name(), "memory");

    let bogus = SessionBackendConfig {
        backend: "redis".to_string(),
        ..SessionBackendConfig::default()
    };
    assert!(SessionBackend::from_config(&bogus, temp.path()).await.is_err());
}
