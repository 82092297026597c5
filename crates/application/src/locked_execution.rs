use std::any::{Any, type_name};
use std::fmt::{self, Display, Formatter};
use std::future::Future;
use std::time::Duration;

use latchkey_core::{AppError, AppResult, LockName, OwnerContextId};
use tracing::{info, warn};

use crate::lock_coordinator::LockCoordinator;
use crate::lock_handle::LockHandle;


/// Identifies the guarded operation a lock is taken for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    target: String,
    operation: String,
}

impl CallContext {
    /// Creates a call context for `operation` on `target`.
    #[must_use]
    pub fn new(target: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            operation: operation.into(),
        }
    }

    /// Returns the component the operation belongs to.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns the operation name.
    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Returns the lock name used when a request does not name one.
    pub fn default_lock_name(&self) -> AppResult<LockName> {
        LockName::new(self.to_string())
    }
}

impl Display for CallContext {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}.{}", self.target, self.operation)
    }
}

/// One lock a guarded call needs, with optional lease and wait overrides.
#[derive(Debug, Clone)]
pub struct LockRequest {
    lock_name: LockName,
    lease_time: Option<Duration>,
    wait_time: Option<Duration>,
}

impl LockRequest {
    /// Requests the lock with the given name.
    #[must_use]
    pub fn named(lock_name: LockName) -> Self {
        Self {
            lock_name,
            lease_time: None,
            wait_time: None,
        }
    }

    /// Requests a lock for `call`, named `lock_name` when given and
    /// `"{target}.{operation}"` otherwise.
    pub fn for_call(call: &CallContext, lock_name: Option<&str>) -> AppResult<Self> {
        let lock_name = match lock_name {
            Some(lock_name) => LockName::new(lock_name)?,
            None => call.default_lock_name()?,
        };

        Ok(Self::named(lock_name))
    }

    /// Overrides the lease time.
    #[must_use]
    pub fn with_lease_time(mut self, lease_time: Duration) -> Self {
        self.lease_time = Some(lease_time);
        self
    }

    /// Overrides the wait time.
    #[must_use]
    pub fn with_wait_time(mut self, wait_time: Duration) -> Self {
        self.wait_time = Some(wait_time);
        self
    }

    /// Returns the requested lock name.
    #[must_use]
    pub fn lock_name(&self) -> &LockName {
        &self.lock_name
    }

    /// Returns the lease time, falling back to `default`.
    #[must_use]
    pub fn lease_time_or(&self, default: Duration) -> Duration {
        self.lease_time.unwrap_or(default)
    }

    /// Returns the wait time, falling back to `default`.
    #[must_use]
    pub fn wait_time_or(&self, default: Duration) -> Duration {
        self.wait_time.unwrap_or(default)
    }
}

/// Type-erased substitute result produced by a failure strategy.
pub type FailureOutcome = Box<dyn Any + Send>;

/// Decides what a guarded call returns when its lock cannot be acquired.
///
/// The outcome must hold the call's result type; any other type fails the
/// call with [`AppError::CallbackContract`].
pub trait LockFailStrategy: Send + Sync {
    /// Produces the substitute result for `call`, or an error.
    fn on_fail(&self, lock_name: &LockName, call: &CallContext) -> AppResult<FailureOutcome>;
}

/// Fails the call with [`AppError::AcquisitionFailed`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultLockFailStrategy;

impl LockFailStrategy for DefaultLockFailStrategy {
    fn on_fail(&self, lock_name: &LockName, call: &CallContext) -> AppResult<FailureOutcome> {
        Err(AppError::AcquisitionFailed {
            lock_name: lock_name.to_string(),
            operation: call.to_string(),
        })
    }
}

/// Answers every failed acquisition with the same value.
#[derive(Debug, Clone)]
pub struct FallbackValueStrategy<T> {
    value: T,
}

impl<T> FallbackValueStrategy<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Creates a strategy returning `value`.
    #[must_use]
    pub fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> LockFailStrategy for FallbackValueStrategy<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn on_fail(&self, _lock_name: &LockName, _call: &CallContext) -> AppResult<FailureOutcome> {
        Ok(Box::new(self.value.clone()))
    }
}

/// Runs work while holding a set of locks.
#[derive(Clone)]
pub struct LockedExecutor {
    coordinator: LockCoordinator,
}

impl LockedExecutor {
    /// Creates an executor acquiring through `coordinator`.
    #[must_use]
    pub fn new(coordinator: LockCoordinator) -> Self {
        Self { coordinator }
    }

    /// Returns the underlying coordinator.
    #[must_use]
    pub fn coordinator(&self) -> &LockCoordinator {
        &self.coordinator
    }

    /// Acquires every requested lock in order, runs `work`, then releases the
    /// locks in reverse order.
    ///
    /// When a lock cannot be acquired within its wait time, locks taken so far
    /// are released and `fail_strategy` supplies the result instead.
    pub async fn execute<T, F, Fut>(
        &self,
        owner: &OwnerContextId,
        call: &CallContext,
        requests: &[LockRequest],
        fail_strategy: &dyn LockFailStrategy,
        work: F,
    ) -> AppResult<T>
    where
        T: 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let settings = self.coordinator.settings();
        let mut held = HeldLocks::new(self.coordinator.clone(), requests.len());

        for request in requests {
            let acquired = self
                .coordinator
                .try_acquire(
                    owner,
                    request.lock_name(),
                    request.lease_time_or(settings.default_lease_time),
                    request.wait_time_or(settings.default_wait_time),
                )
                .await;

            match acquired {
                Ok(Some(handle)) => held.push(handle),
                Ok(None) => {
                    held.release_all().await;
                    info!(
                        lock_name = %request.lock_name(),
                        call = %call,
                        owner = %owner,
                        "lock unavailable, applying fail strategy"
                    );
                    return substitute_result(fail_strategy, request.lock_name(), call);
                }
                Err(error) => {
                    held.release_all().await;
                    return Err(error);
                }
            }
        }

        let outcome = work().await;
        held.release_all().await;
        outcome
    }
}

/// Locks taken for one guarded call.
///
/// Locks still held when the guard is dropped, because the call was cancelled
/// or its work panicked, are released on a background task.
struct HeldLocks {
    coordinator: LockCoordinator,
    handles: Vec<LockHandle>,
}

impl HeldLocks {
    fn new(coordinator: LockCoordinator, capacity: usize) -> Self {
        Self {
            coordinator,
            handles: Vec::with_capacity(capacity),
        }
    }

    fn push(&mut self, handle: LockHandle) {
        self.handles.push(handle);
    }

    /// Releases the held locks in reverse acquisition order.
    async fn release_all(mut self) {
        while let Some(handle) = self.handles.last() {
            release_logged(&self.coordinator, handle).await;
            self.handles.pop();
        }
    }
}

impl Drop for HeldLocks {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }

        let handles = std::mem::take(&mut self.handles);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                held_locks = handles.len(),
                "guarded call abandoned outside a runtime, its locks stay held until their leases lapse"
            );
            return;
        };

        warn!(
            held_locks = handles.len(),
            "guarded call ended before releasing its locks, releasing in the background"
        );
        let coordinator = self.coordinator.clone();
        runtime.spawn(async move {
            for handle in handles.iter().rev() {
                release_logged(&coordinator, handle).await;
            }
        });
    }
}

async fn release_logged(coordinator: &LockCoordinator, handle: &LockHandle) {
    match coordinator.release(handle).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                lock_name = %handle.lock_name(),
                owner = %handle.owner(),
                "lock release was not confirmed by the backend"
            );
        }
        Err(error) => {
            warn!(
                lock_name = %handle.lock_name(),
                owner = %handle.owner(),
                error = %error,
                "failed to release lock after guarded call"
            );
        }
    }
}

fn substitute_result<T: 'static>(
    fail_strategy: &dyn LockFailStrategy,
    lock_name: &LockName,
    call: &CallContext,
) -> AppResult<T> {
    let outcome = fail_strategy.on_fail(lock_name, call)?;

    outcome
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| {
            AppError::CallbackContract(format!(
                "fail strategy for '{call}' on lock '{lock_name}' did not return a '{}'",
                type_name::<T>()
            ))
        })
}
