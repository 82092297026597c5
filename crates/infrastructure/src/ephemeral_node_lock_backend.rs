use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_application::{BackendState, LockBackend};
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

/// Default parent path for lock nodes.
pub const DEFAULT_LOCK_ROOT: &str = "/locks";

const NODE_PREFIX: &str = "lock-";

/// Session-bound client of a hierarchical node store with ephemeral
/// sequential nodes.
///
/// Ephemeral nodes disappear when the session that created them ends.
#[async_trait]
pub trait NodeTreeClient: Send + Sync {
    /// Creates an ephemeral node under `parent` whose name is `prefix`
    /// followed by a zero-padded sequence number unique within `parent`.
    /// Missing parents are created. Returns the full node path.
    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: &str,
    ) -> AppResult<String>;

    /// Lists the child node names under `parent`.
    async fn children(&self, parent: &str) -> AppResult<Vec<String>>;

    /// Waits until the node at `path` no longer exists. Returns false when
    /// `timeout` elapses first.
    async fn wait_for_deletion(&self, path: &str, timeout: Duration) -> AppResult<bool>;

    /// Deletes the node at `path`. Returns false when it did not exist.
    async fn delete(&self, path: &str) -> AppResult<bool>;
}

/// Path of the node representing one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockNode {
    path: String,
}

impl LockNode {
    /// Returns the full node path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Lock backend queueing contenders as ephemeral sequential nodes.
///
/// The contender owning the lowest-ordered node holds the lock; every other
/// contender watches only its immediate predecessor. Liveness is tied to the
/// client session, so leases are never renewed.
#[derive(Clone)]
pub struct EphemeralNodeLockBackend {
    client: Arc<dyn NodeTreeClient>,
    root: String,
}

impl EphemeralNodeLockBackend {
    /// Creates a backend rooted at [`DEFAULT_LOCK_ROOT`].
    #[must_use]
    pub fn new(client: Arc<dyn NodeTreeClient>) -> Self {
        Self::with_root(client, DEFAULT_LOCK_ROOT)
    }

    /// Creates a backend rooted at `root`.
    #[must_use]
    pub fn with_root(client: Arc<dyn NodeTreeClient>, root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            client,
            root: root.trim_end_matches('/').to_owned(),
        }
    }

    fn lock_path(&self, lock_name: &LockName) -> String {
        format!("{}/{lock_name}", self.root)
    }

    /// Waits until `node_name` is the first child of `parent`.
    async fn wait_for_turn(
        &self,
        parent: &str,
        node_name: &str,
        deadline: Instant,
    ) -> AppResult<bool> {
        loop {
            let mut siblings = self.client.children(parent).await?;
            siblings.sort();

            let Some(position) = siblings.iter().position(|sibling| sibling == node_name) else {
                return Err(AppError::BackendUnavailable(format!(
                    "lock node '{parent}/{node_name}' vanished while waiting"
                )));
            };

            let Some(predecessor) = position.checked_sub(1).map(|index| &siblings[index]) else {
                return Ok(true);
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }

            let predecessor_path = format!("{parent}/{predecessor}");
            debug!(
                node = %node_name,
                predecessor = %predecessor_path,
                "waiting for preceding lock node"
            );
            if !self
                .client
                .wait_for_deletion(&predecessor_path, remaining)
                .await?
            {
                return Ok(false);
            }
        }
    }

    async fn abandon(&self, node_path: &str) {
        if let Err(error) = self.client.delete(node_path).await {
            warn!(
                node = %node_path,
                error = %error,
                "failed to delete abandoned lock node"
            );
        }
    }
}

#[async_trait]
impl LockBackend for EphemeralNodeLockBackend {
    fn backend_name(&self) -> &'static str {
        "ephemeral-node"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _lease_time: Duration,
        wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        let deadline = Instant::now().checked_add(wait_time).ok_or_else(|| {
            AppError::Validation(format!("lock wait time for '{lock_name}' is too large"))
        })?;
        let parent = self.lock_path(lock_name);
        let node_path = self
            .client
            .create_ephemeral_sequential(&parent, NODE_PREFIX, owner_token.as_str())
            .await?;
        let node_name = node_path
            .rsplit_once('/')
            .map_or(node_path.as_str(), |(_, name)| name)
            .to_owned();

        match self.wait_for_turn(&parent, &node_name, deadline).await {
            Ok(true) => Ok(Some(BackendState::new(LockNode { path: node_path }))),
            Ok(false) => {
                self.abandon(&node_path).await;
                Ok(None)
            }
            Err(error) => {
                self.abandon(&node_path).await;
                Err(error)
            }
        }
    }

    async fn release(
        &self,
        lock_name: &LockName,
        _owner_token: &OwnerToken,
        state: &BackendState,
    ) -> AppResult<bool> {
        let node = state.downcast_ref::<LockNode>().ok_or_else(|| {
            AppError::Internal(format!(
                "lock '{lock_name}' handle carries no ephemeral node"
            ))
        })?;

        self.client.delete(node.path()).await
    }

    fn supports_owner_scoped_reentrancy(&self) -> bool {
        true
    }
}
