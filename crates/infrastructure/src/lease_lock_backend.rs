use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_application::{BackendState, LockBackend};
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};
use tracing::warn;


/// Default namespace for lease-bound lock keys.
pub const DEFAULT_LOCK_NAMESPACE: &str = "latchkey";

/// Identifier of a granted lease.
pub type LeaseId = i64;

/// Client of a service granting TTL leases and lease-bound locks.
#[async_trait]
pub trait LeaseServiceClient: Send + Sync {
    /// Grants a lease living `ttl_seconds` unless kept alive.
    async fn grant(&self, ttl_seconds: i64) -> AppResult<LeaseId>;

    /// Refreshes the lease to its granted TTL. Returns false when the lease
    /// no longer exists.
    async fn keep_alive_once(&self, lease_id: LeaseId) -> AppResult<bool>;

    /// Waits up to `timeout` to lock `name` under `lease_id`. Returns the
    /// ownership key on success and `None` on timeout.
    async fn lock(
        &self,
        name: &str,
        lease_id: LeaseId,
        timeout: Duration,
    ) -> AppResult<Option<String>>;

    /// Releases the lock identified by `ownership_key`. Returns false when it
    /// was not held.
    async fn unlock(&self, ownership_key: &str) -> AppResult<bool>;

    /// Revokes the lease and every lock bound to it. Returns false when the
    /// lease no longer exists.
    async fn revoke(&self, lease_id: LeaseId) -> AppResult<bool>;
}

/// Lease and ownership key behind one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseLock {
    ownership_key: String,
    lease_id: LeaseId,
}

impl LeaseLock {
    /// Returns the ownership key issued by the lock service.
    #[must_use]
    pub fn ownership_key(&self) -> &str {
        &self.ownership_key
    }

    /// Returns the lease the lock is bound to.
    #[must_use]
    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }
}

/// Lock backend binding each acquisition to its own lease.
///
/// A crashed holder's lock disappears when its lease expires; the renewal
/// scheduler keeps live leases alive.
#[derive(Clone)]
pub struct LeaseLockBackend {
    client: Arc<dyn LeaseServiceClient>,
    namespace: String,
}

impl LeaseLockBackend {
    /// Creates a backend using [`DEFAULT_LOCK_NAMESPACE`].
    #[must_use]
    pub fn new(client: Arc<dyn LeaseServiceClient>) -> Self {
        Self::with_namespace(client, DEFAULT_LOCK_NAMESPACE)
    }

    /// Creates a backend placing lock keys under `namespace`.
    #[must_use]
    pub fn with_namespace(client: Arc<dyn LeaseServiceClient>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn lock_key(&self, lock_name: &LockName) -> String {
        format!("{}/{lock_name}", self.namespace)
    }

    async fn revoke_quietly(&self, lock_name: &LockName, lease_id: LeaseId) {
        if let Err(error) = self.client.revoke(lease_id).await {
            warn!(
                lock_name = %lock_name,
                lease_id,
                error = %error,
                "failed to revoke unused lock lease"
            );
        }
    }
}

/// Rounds a lease up to whole seconds, never below one.
fn lease_ttl_seconds(lease_time: Duration) -> AppResult<i64> {
    let rounded_up = lease_time
        .as_secs()
        .saturating_add(u64::from(lease_time.subsec_nanos() > 0));

    i64::try_from(rounded_up.max(1))
        .map_err(|_| AppError::Validation("lock lease time is out of range".to_owned()))
}

fn lease_lock<'a>(lock_name: &LockName, state: &'a BackendState) -> AppResult<&'a LeaseLock> {
    state.downcast_ref::<LeaseLock>().ok_or_else(|| {
        AppError::Internal(format!("lock '{lock_name}' handle carries no lease"))
    })
}

#[async_trait]
impl LockBackend for LeaseLockBackend {
    fn backend_name(&self) -> &'static str {
        "lease"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        _owner_token: &OwnerToken,
        lease_time: Duration,
        wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        let lease_id = self.client.grant(lease_ttl_seconds(lease_time)?).await?;

        match self
            .client
            .lock(&self.lock_key(lock_name), lease_id, wait_time)
            .await
        {
            Ok(Some(ownership_key)) => Ok(Some(BackendState::new(LeaseLock {
                ownership_key,
                lease_id,
            }))),
            Ok(None) => {
                self.revoke_quietly(lock_name, lease_id).await;
                Ok(None)
            }
            Err(error) => {
                self.revoke_quietly(lock_name, lease_id).await;
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
        let lease = lease_lock(lock_name, state)?;
        let unlocked = self.client.unlock(lease.ownership_key()).await;
        let revoked = self.client.revoke(lease.lease_id()).await;

        let unlocked = unlocked?;
        revoked?;
        Ok(unlocked)
    }

    async fn renew(
        &self,
        lock_name: &LockName,
        _owner_token: &OwnerToken,
        state: &BackendState,
        _lease_time: Duration,
    ) -> AppResult<bool> {
        let lease = lease_lock(lock_name, state)?;
        self.client.keep_alive_once(lease.lease_id()).await
    }

    fn supports_owner_scoped_reentrancy(&self) -> bool {
        true
    }

    fn supports_renewal(&self) -> bool {
        true
    }
}
