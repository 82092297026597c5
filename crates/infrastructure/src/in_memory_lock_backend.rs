use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use latchkey_application::{BackendState, LockBackend};
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};
use tokio::time::Instant;

#[derive(Debug)]
struct HeldKey {
    owner_token: OwnerToken,
    expires_at: Instant,
}

impl HeldKey {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Process-local TTL key-value lock backend.
///
/// Locks are only exclusive within one process. Useful for development and
/// tests; capability flags can be switched off to exercise the coordinator
/// without renewal or tracked reentrancy.
#[derive(Debug)]
pub struct InMemoryLockBackend {
    keys: DashMap<LockName, HeldKey>,
    renewal: bool,
    coordinator_reentrancy: bool,
}

impl Default for InMemoryLockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockBackend {
    /// Creates an empty backend supporting renewal and tracked reentrancy.
    #[must_use]
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            renewal: true,
            coordinator_reentrancy: true,
        }
    }

    /// Enables or disables lease renewal.
    #[must_use]
    pub fn with_renewal(mut self, renewal: bool) -> Self {
        self.renewal = renewal;
        self
    }

    /// Enables or disables reentrancy tracking by the coordinator.
    #[must_use]
    pub fn with_coordinator_reentrancy(mut self, coordinator_reentrancy: bool) -> Self {
        self.coordinator_reentrancy = coordinator_reentrancy;
        self
    }

    /// Returns the token currently holding `lock_name`, ignoring expired keys.
    #[must_use]
    pub fn holder(&self, lock_name: &LockName) -> Option<OwnerToken> {
        let now = Instant::now();
        self.keys
            .get(lock_name)
            .filter(|held| held.is_live(now))
            .map(|held| held.owner_token.clone())
    }
}

fn expiry_after(now: Instant, lease_time: Duration) -> AppResult<Instant> {
    now.checked_add(lease_time)
        .ok_or_else(|| AppError::Validation("lock lease time is out of range".to_owned()))
}

#[async_trait]
impl LockBackend for InMemoryLockBackend {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        lease_time: Duration,
        _wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        let now = Instant::now();
        let expires_at = expiry_after(now, lease_time)?;
        let held = HeldKey {
            owner_token: owner_token.clone(),
            expires_at,
        };

        match self.keys.entry(lock_name.clone()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => Ok(None),
            Entry::Occupied(mut entry) => {
                entry.insert(held);
                Ok(Some(BackendState::empty()))
            }
            Entry::Vacant(entry) => {
                entry.insert(held);
                Ok(Some(BackendState::empty()))
            }
        }
    }

    async fn release(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
    ) -> AppResult<bool> {
        Ok(self
            .keys
            .remove_if(lock_name, |_, held| &held.owner_token == owner_token)
            .is_some())
    }

    async fn renew(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
        lease_time: Duration,
    ) -> AppResult<bool> {
        let now = Instant::now();
        let expires_at = expiry_after(now, lease_time)?;

        match self.keys.get_mut(lock_name) {
            Some(mut held) if &held.owner_token == owner_token && held.is_live(now) => {
                held.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn supports_owner_scoped_reentrancy(&self) -> bool {
        self.coordinator_reentrancy
    }

    fn supports_renewal(&self) -> bool {
        self.renewal
    }
}
