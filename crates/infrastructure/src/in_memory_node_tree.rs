use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_core::{AppError, AppResult};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::ephemeral_node_lock_backend::NodeTreeClient;

#[derive(Debug)]
struct Node {
    session_id: u64,
    data: String,
}

#[derive(Debug, Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    live_sessions: Vec<u64>,
    next_session_id: u64,
}

#[derive(Debug)]
struct SharedTree {
    state: Mutex<TreeState>,
    deletions: watch::Sender<u64>,
}

impl SharedTree {
    fn announce_deletion(&self) {
        self.deletions.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }
}

/// Process-local node store with sessions, ephemeral sequential nodes, and
/// deletion watches.
#[derive(Debug, Clone)]
pub struct InMemoryNodeTree {
    shared: Arc<SharedTree>,
}

impl Default for InMemoryNodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryNodeTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        let (deletions, _) = watch::channel(0);
        Self {
            shared: Arc::new(SharedTree {
                state: Mutex::new(TreeState::default()),
                deletions,
            }),
        }
    }

    /// Opens a new client session.
    pub async fn connect(&self) -> InMemoryNodeSession {
        let mut state = self.shared.state.lock().await;
        state.next_session_id = state.next_session_id.wrapping_add(1);
        let session_id = state.next_session_id;
        state.live_sessions.push(session_id);

        InMemoryNodeSession {
            shared: Arc::clone(&self.shared),
            session_id,
        }
    }

    /// Ends a session, deleting every ephemeral node it created.
    pub async fn expire_session(&self, session: &InMemoryNodeSession) -> usize {
        let mut state = self.shared.state.lock().await;
        state.live_sessions.retain(|live| *live != session.session_id);

        let before = state.nodes.len();
        state
            .nodes
            .retain(|_, node| node.session_id != session.session_id);
        let removed = before - state.nodes.len();
        drop(state);

        if removed > 0 {
            self.shared.announce_deletion();
        }
        removed
    }

    /// Returns the data stored at `path`.
    pub async fn node_data(&self, path: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .await
            .nodes
            .get(path)
            .map(|node| node.data.clone())
    }

    /// Returns the number of nodes in the tree.
    pub async fn node_count(&self) -> usize {
        self.shared.state.lock().await.nodes.len()
    }
}

/// One client session of an [`InMemoryNodeTree`].
#[derive(Debug, Clone)]
pub struct InMemoryNodeSession {
    shared: Arc<SharedTree>,
    session_id: u64,
}

impl InMemoryNodeSession {
    fn ensure_live(&self, state: &TreeState) -> AppResult<()> {
        if state.live_sessions.contains(&self.session_id) {
            return Ok(());
        }

        Err(AppError::BackendUnavailable(format!(
            "node tree session {} has expired",
            self.session_id
        )))
    }
}

#[async_trait]
impl NodeTreeClient for InMemoryNodeSession {
    async fn create_ephemeral_sequential(
        &self,
        parent: &str,
        prefix: &str,
        data: &str,
    ) -> AppResult<String> {
        let mut state = self.shared.state.lock().await;
        self.ensure_live(&state)?;

        let sequence = state.sequences.entry(parent.to_owned()).or_insert(0);
        let path = format!("{parent}/{prefix}{:010}", *sequence);
        *sequence = sequence.wrapping_add(1);

        state.nodes.insert(
            path.clone(),
            Node {
                session_id: self.session_id,
                data: data.to_owned(),
            },
        );
        Ok(path)
    }

    async fn children(&self, parent: &str) -> AppResult<Vec<String>> {
        let state = self.shared.state.lock().await;
        self.ensure_live(&state)?;

        let prefix = format!("{parent}/");
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(prefix.as_str()))
            .filter_map(|(path, _)| path.strip_prefix(prefix.as_str()))
            .filter(|name| !name.contains('/'))
            .map(str::to_owned)
            .collect())
    }

    async fn wait_for_deletion(&self, path: &str, timeout: Duration) -> AppResult<bool> {
        let deadline = Instant::now() + timeout;
        let mut deletions = self.shared.deletions.subscribe();

        loop {
            {
                let state = self.shared.state.lock().await;
                self.ensure_live(&state)?;
                if !state.nodes.contains_key(path) {
                    return Ok(true);
                }
            }

            match tokio::time::timeout_at(deadline, deletions.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(AppError::BackendUnavailable(
                        "node tree watch channel closed".to_owned(),
                    ));
                }
                Err(_) => return Ok(false),
            }
        }
    }

    async fn delete(&self, path: &str) -> AppResult<bool> {
        let deleted = self.shared.state.lock().await.nodes.remove(path).is_some();
        if deleted {
            self.shared.announce_deletion();
        }
        Ok(deleted)
    }
}
