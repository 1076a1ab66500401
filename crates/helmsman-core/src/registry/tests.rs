use super::*;
use crate::store::MemoryStore;
use std::sync::atomic::AtomicUsize;

struct Echo {
    resets: AtomicUsize,
}

#[async_trait]
impl Worker for Echo {
    async fn invoke(
        &self,
        instruction: &str,
        _cancel: CancellationToken,
    ) -> std::result::Result<StepOutput, WorkerFailure> {
        Ok(StepOutput::text(instruction))
    }

    async fn reset(&self) -> std::result::Result<(), WorkerFailure> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn echo() -> Arc<Echo> {
    Arc::new(Echo {
        resets: AtomicUsize::new(0),
    })
}

#[tokio::test]
async fn test_register_and_resolve() {
    let registry = WorkerRegistry::new();
    assert!(registry.resolve("browse").is_none());

    registry
        .register("browse", WorkerHandle::new("browser-1", echo()))
        .await
        .unwrap();
    let handle = registry.resolve("browse").unwrap();
    assert_eq!(handle.capability(), "browse");
    assert_eq!(handle.identity(), "browser-1");
    assert!(handle.is_healthy());

    let out = handle
        .worker()
        .invoke("open page", CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.text, "open page");
}

#[tokio::test]
async fn test_last_writer_wins() {
    let registry = WorkerRegistry::new();
    registry
        .register("browse", WorkerHandle::new("old", echo()))
        .await
        .unwrap();
    let replaced = registry
        .register("browse", WorkerHandle::new("new", echo()))
        .await
        .unwrap();
    assert_eq!(replaced.unwrap().identity(), "old");
    assert_eq!(registry.resolve("browse").unwrap().identity(), "new");
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_deregister() {
    let registry = WorkerRegistry::new();
    registry
        .register("shell", WorkerHandle::new("sh", echo()))
        .await
        .unwrap();
    assert!(registry.deregister("shell").await.unwrap().is_some());
    assert!(registry.deregister("shell").await.unwrap().is_none());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_bindings_are_persisted() {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let registry = WorkerRegistry::new().with_store(Arc::clone(&store));
    registry
        .register("read-files", WorkerHandle::new("fs", echo()))
        .await
        .unwrap();
    registry
        .register("browse", WorkerHandle::new("web", echo()))
        .await
        .unwrap();
    registry.deregister("read-files").await.unwrap();

    // A fresh registry over the same store sees the last snapshot
    let reopened = WorkerRegistry::new().with_store(store);
    let persisted = reopened.persisted_bindings().await.unwrap();
    assert_eq!(
        persisted.bindings,
        vec![WorkerBinding {
            capability: "browse".to_string(),
            identity: "web".to_string(),
        }]
    );
    assert_eq!(persisted.journal.len(), 3);
    assert_eq!(persisted.journal[2].kind, RegistryEventKind::Deregistered);
}

#[tokio::test]
async fn test_reset_all() {
    let registry = WorkerRegistry::new();
    let a = echo();
    let b = echo();
    registry
        .register("a", WorkerHandle::new("a", a.clone()))
        .await
        .unwrap();
    registry
        .register("b", WorkerHandle::new("b", b.clone()))
        .await
        .unwrap();
    assert!(registry.reset_all().await.is_empty());
    assert_eq!(a.resets.load(Ordering::SeqCst), 1);
    assert_eq!(b.resets.load(Ordering::SeqCst), 1);
    assert_eq!(registry.tags(), vec!["a", "b"]);
}

#[test]
fn test_health_flag_is_shared_between_clones() {
    let handle = WorkerHandle::new("w", echo());
    let clone = handle.clone();
    clone.set_healthy(false);
    assert!(!handle.is_healthy());
}
