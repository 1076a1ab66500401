use super::*;

#[test]
fn test_cancel_is_idempotent_and_scoped() {
    let controller = CancellationController::new();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let token_a = controller.create(a);
    let token_b = controller.create(b);

    assert!(controller.cancel(a));
    assert!(controller.cancel(a));
    assert!(token_a.is_cancelled());
    assert!(!token_b.is_cancelled());
    assert!(controller.is_cancelled(a));
    assert!(!controller.is_cancelled(b));
}

#[test]
fn test_create_returns_same_token() {
    let controller = CancellationController::new();
    let id = Uuid::new_v4();
    let first = controller.create(id);
    controller.create(id).cancel();
    assert!(first.is_cancelled());
    assert_eq!(controller.active_count(), 1);
}

#[test]
fn test_unknown_session() {
    let controller = CancellationController::new();
    assert!(!controller.cancel(Uuid::new_v4()));
    assert!(controller.token(Uuid::new_v4()).is_none());
}

#[test]
fn test_cancel_all_reaches_children() {
    let root = CancellationToken::new();
    let controller = CancellationController::with_root(root.clone());
    let token = controller.create(Uuid::new_v4());
    controller.cancel_all();
    assert!(root.is_cancelled());
    assert!(token.is_cancelled());
}

#[test]
fn test_release_forgets_session() {
    let controller = CancellationController::new();
    let id = Uuid::new_v4();
    controller.create(id);
    controller.release(id);
    assert_eq!(controller.active_count(), 0);
    assert!(!controller.cancel(id));
}

#[test]
fn test_child_token_sees_session_cancel() {
    let controller = CancellationController::new();
    let id = Uuid::new_v4();
    let worker_token = controller.create(id).child_token();
    tokio_test::block_on(async {
        controller.cancel(id);
        worker_token.cancelled().await;
    });
}
