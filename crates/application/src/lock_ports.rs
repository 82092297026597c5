use std::any::Any;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_core::{AppError, AppResult, LockName, OwnerToken};

/// Backend-specific data a backend needs back at release or renewal time,
/// such as a node path or a lease identifier.
#[derive(Clone, Default)]
pub struct BackendState(Option<Arc<dyn Any + Send + Sync>>);

impl BackendState {
    /// Creates state that carries nothing beyond the lock name and token.
    #[must_use]
    pub fn empty() -> Self {
        Self(None)
    }

    /// Wraps one backend-specific value.
    #[must_use]
    pub fn new<T>(value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        Self(Some(Arc::new(value)))
    }

    /// Returns the wrapped value when it has the requested type.
    #[must_use]
    pub fn downcast_ref<T>(&self) -> Option<&T>
    where
        T: Any,
    {
        self.0.as_deref().and_then(|value| value.downcast_ref::<T>())
    }

    /// Returns whether any backend-specific value is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

impl Debug for BackendState {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackendState")
            .field("present", &self.0.is_some())
            .finish()
    }
}

/// Coordination service port every lock backend implements.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Stable backend name used in logs.
    fn backend_name(&self) -> &'static str;

    /// Makes one backend-native, time-bounded acquisition attempt.
    ///
    /// Returns `Ok(None)` when the lock is held elsewhere. Transient faults are
    /// reported as [`AppError::BackendUnavailable`]; the coordinator retries.
    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        lease_time: Duration,
        wait_time: Duration,
    ) -> AppResult<Option<BackendState>>;

    /// Releases the lock only while it is still owned by `owner_token`.
    ///
    /// Returns false when ownership could not be confirmed, which leaves any
    /// other owner's lock untouched.
    async fn release(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        state: &BackendState,
    ) -> AppResult<bool>;

    /// Extends the lease and returns false when ownership changed.
    async fn renew(
        &self,
        lock_name: &LockName,
        _owner_token: &OwnerToken,
        _state: &BackendState,
        _lease_time: Duration,
    ) -> AppResult<bool> {
        Err(AppError::Validation(format!(
            "backend '{}' does not support renewing lock '{lock_name}'",
            self.backend_name()
        )))
    }

    /// Whether the coordinator tracks reentrant holds for this backend.
    fn supports_owner_scoped_reentrancy(&self) -> bool;

    /// Whether the coordinator schedules periodic renewals.
    fn supports_renewal(&self) -> bool {
        false
    }
}
