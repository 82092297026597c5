use std::sync::Arc;
use std::time::Duration;

use latchkey_application::{BackendState, LockBackend, LockCoordinator};
use latchkey_core::{AppError, LockName, OwnerContextId, OwnerToken};

use super::{EphemeralNodeLockBackend, LockNode};
use crate::in_memory_node_tree::{InMemoryNodeSession, InMemoryNodeTree};

fn lock_name() -> LockName {
    LockName::new("job:42").unwrap_or_else(|_| unreachable!())
}

async fn backend_for(tree: &InMemoryNodeTree) -> (EphemeralNodeLockBackend, InMemoryNodeSession) {
    let session = tree.connect().await;
    let backend = EphemeralNodeLockBackend::new(Arc::new(session.clone()));
    (backend, session)
}

fn node_path(state: &BackendState) -> String {
    state
        .downcast_ref::<LockNode>()
        .map(|node| node.path().to_owned())
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn lowest_node_holds_the_lock() {
    let tree = InMemoryNodeTree::new();
    let (first, _) = backend_for(&tree).await;
    let (second, _) = backend_for(&tree).await;
    let first_token = OwnerToken::generate();
    let lease = Duration::from_secs(30);

    let acquired = first
        .acquire(&lock_name(), &first_token, lease, Duration::ZERO)
        .await;
    let state = acquired.ok().flatten().unwrap_or_else(|| unreachable!());
    assert_eq!(node_path(&state), "/locks/job:42/lock-0000000000");
    assert_eq!(
        tree.node_data(&node_path(&state)).await.as_deref(),
        Some(first_token.as_str())
    );

    let contended = second
        .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::ZERO)
        .await;
    assert!(matches!(contended, Ok(None)));
    assert_eq!(tree.node_count().await, 1);
}

#[tokio::test(start_paused = true)]
async fn waiter_acquires_once_predecessor_is_released() {
    let tree = InMemoryNodeTree::new();
    let (first, _) = backend_for(&tree).await;
    let (second, _) = backend_for(&tree).await;
    let lease = Duration::from_secs(30);
    let first_token = OwnerToken::generate();

    let state = first
        .acquire(&lock_name(), &first_token, lease, Duration::ZERO)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| unreachable!());

    let waiter = tokio::spawn(async move {
        second
            .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(!waiter.is_finished());

    let released = first.release(&lock_name(), &first_token, &state).await;
    assert!(matches!(released, Ok(true)));

    let waited = waiter.await;
    assert!(matches!(waited, Ok(Ok(Some(ref state))) if node_path(state).ends_with("lock-0000000001")));
}

#[tokio::test(start_paused = true)]
async fn expired_session_frees_the_lock() {
    let tree = InMemoryNodeTree::new();
    let (crashed, crashed_session) = backend_for(&tree).await;
    let (successor, _) = backend_for(&tree).await;
    let lease = Duration::from_secs(30);

    let held = crashed
        .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::ZERO)
        .await;
    assert!(matches!(held, Ok(Some(_))));

    let waiter = tokio::spawn(async move {
        successor
            .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::from_secs(5))
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(tree.expire_session(&crashed_session).await, 1);

    assert!(matches!(waiter.await, Ok(Ok(Some(_)))));
}

#[tokio::test(start_paused = true)]
async fn timed_out_waiter_removes_its_node() {
    let tree = InMemoryNodeTree::new();
    let (first, _) = backend_for(&tree).await;
    let (second, _) = backend_for(&tree).await;
    let lease = Duration::from_secs(30);

    let held = first
        .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::ZERO)
        .await;
    assert!(matches!(held, Ok(Some(_))));

    let timed_out = second
        .acquire(&lock_name(), &OwnerToken::generate(), lease, Duration::from_millis(750))
        .await;
    assert!(matches!(timed_out, Ok(None)));
    assert_eq!(tree.node_count().await, 1);
}

#[tokio::test]
async fn acquiring_on_an_expired_session_fails() {
    let tree = InMemoryNodeTree::new();
    let (backend, session) = backend_for(&tree).await;
    tree.expire_session(&session).await;

    let acquired = backend
        .acquire(&lock_name(), &OwnerToken::generate(), Duration::from_secs(30), Duration::ZERO)
        .await;

    assert!(matches!(acquired, Err(AppError::BackendUnavailable(_))));
}

#[tokio::test]
async fn release_without_node_state_is_an_internal_error() {
    let tree = InMemoryNodeTree::new();
    let (backend, _) = backend_for(&tree).await;

    let released = backend
        .release(&lock_name(), &OwnerToken::generate(), &BackendState::empty())
        .await;

    assert!(matches!(released, Err(AppError::Internal(_))));
}

#[tokio::test]
async fn custom_root_is_normalized() {
    let tree = InMemoryNodeTree::new();
    let session = tree.connect().await;
    let backend = EphemeralNodeLockBackend::with_root(Arc::new(session), "/services/locks/");

    let acquired = backend
        .acquire(&lock_name(), &OwnerToken::generate(), Duration::from_secs(30), Duration::ZERO)
        .await;
    let state = acquired.ok().flatten().unwrap_or_else(|| unreachable!());

    assert_eq!(node_path(&state), "/services/locks/job:42/lock-0000000000");
    assert!(!backend.supports_renewal());
}

#[tokio::test(start_paused = true)]
async fn coordinator_tracks_reentrancy_over_nodes() {
    let tree = InMemoryNodeTree::new();
    let (backend, _) = backend_for(&tree).await;
    let coordinator = LockCoordinator::new(Arc::new(backend) as Arc<dyn LockBackend>);
    let context = OwnerContextId::new();
    let lease = Duration::from_secs(30);

    let outer = coordinator
        .try_acquire(&context, &lock_name(), lease, Duration::ZERO)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| unreachable!());
    let inner = coordinator
        .try_acquire(&context, &lock_name(), lease, Duration::ZERO)
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| unreachable!());

    assert_eq!(tree.node_count().await, 1);
    assert!(!coordinator.renewals().is_scheduled(&lock_name()));

    assert!(matches!(coordinator.release(&inner).await, Ok(true)));
    assert_eq!(tree.node_count().await, 1);
    assert!(matches!(coordinator.release(&outer).await, Ok(true)));
    assert_eq!(tree.node_count().await, 0);
}
