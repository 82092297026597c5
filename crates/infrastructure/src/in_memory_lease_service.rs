use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_core::{AppError, AppResult};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;

use crate::lease_lock_backend::{LeaseId, LeaseServiceClient};

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    expires_at: Instant,
}

#[derive(Debug)]
struct LeasedLock {
    ownership_key: String,
    lease_id: LeaseId,
}

#[derive(Debug, Default)]
struct LeaseState {
    leases: HashMap<LeaseId, Lease>,
    locks: HashMap<String, LeasedLock>,
    next_lease_id: LeaseId,
}

impl LeaseState {
    fn purge_expired(&mut self, now: Instant) {
        self.leases.retain(|_, lease| lease.expires_at > now);
        let leases = &self.leases;
        self.locks
            .retain(|_, lock| leases.contains_key(&lock.lease_id));
    }

    fn drop_lease(&mut self, lease_id: LeaseId) -> bool {
        let existed = self.leases.remove(&lease_id).is_some();
        self.locks.retain(|_, lock| lock.lease_id != lease_id);
        existed
    }
}

/// Process-local lease service with TTL leases and lease-bound locks.
#[derive(Debug, Clone)]
pub struct InMemoryLeaseService {
    state: Arc<Mutex<LeaseState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for InMemoryLeaseService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLeaseService {
    /// Creates a service with no leases.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(LeaseState::default())),
            changes: Arc::new(changes),
        }
    }

    fn announce_change(&self) {
        self.changes.send_modify(|generation| {
            *generation = generation.wrapping_add(1);
        });
    }

    /// Returns the number of live leases.
    pub async fn live_lease_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.leases.len()
    }

    /// Returns the ownership key currently holding `name`.
    pub async fn holder(&self, name: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        state.locks.get(name).map(|lock| lock.ownership_key.clone())
    }
}

#[async_trait]
impl LeaseServiceClient for InMemoryLeaseService {
    async fn grant(&self, ttl_seconds: i64) -> AppResult<LeaseId> {
        let ttl = u64::try_from(ttl_seconds)
            .ok()
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                AppError::Validation(format!("lease ttl must be positive, got {ttl_seconds}"))
            })?;

        let mut state = self.state.lock().await;
        state.next_lease_id = state.next_lease_id.wrapping_add(1);
        let lease_id = state.next_lease_id;
        state.leases.insert(
            lease_id,
            Lease {
                ttl,
                expires_at: Instant::now() + ttl,
            },
        );

        Ok(lease_id)
    }

    async fn keep_alive_once(&self, lease_id: LeaseId) -> AppResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.purge_expired(now);

        Ok(match state.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.expires_at = now + lease.ttl;
                true
            }
            None => false,
        })
    }

    async fn lock(
        &self,
        name: &str,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> AppResult<Option<String>> {
        let deadline = Instant::now() + timeout;
        let mut changes = self.changes.subscribe();

        loop {
            let wake_at = {
                let now = Instant::now();
                let mut state = self.state.lock().await;
                state.purge_expired(now);

                if !state.leases.contains_key(&lease_id) {
                    return Err(AppError::BackendUnavailable(format!(
                        "lease {lease_id} not found"
                    )));
                }

                let holder_expiry = match state.locks.get(name) {
                    None => {
                        let ownership_key = format!("{name}/{lease_id:x}");
                        state.locks.insert(
                            name.to_owned(),
                            LeasedLock {
                                ownership_key: ownership_key.clone(),
                                lease_id,
                            },
                        );
                        return Ok(Some(ownership_key));
                    }
                    Some(holder) => state
                        .leases
                        .get(&holder.lease_id)
                        .map_or(now, |lease| lease.expires_at),
                };

                if now >= deadline {
                    return Ok(None);
                }
                holder_expiry.min(deadline)
            };

            match tokio::time::timeout_at(wake_at, changes.changed()).await {
                Ok(Ok(())) | Err(_) => {}
                Ok(Err(_)) => {
                    return Err(AppError::BackendUnavailable(
                        "lease service change feed closed".to_owned(),
                    ));
                }
            }
        }
    }

    async fn unlock(&self, ownership_key: &str) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let before = state.locks.len();
        state
            .locks
            .retain(|_, lock| lock.ownership_key != ownership_key);
        let unlocked = state.locks.len() < before;
        drop(state);

        if unlocked {
            self.announce_change();
        }
        Ok(unlocked)
    }

    async fn revoke(&self, lease_id: LeaseId) -> AppResult<bool> {
        let revoked = self.state.lock().await.drop_lease(lease_id);
        if revoked {
            self.announce_change();
        }
        Ok(revoked)
    }
}
