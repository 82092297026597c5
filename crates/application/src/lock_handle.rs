use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use latchkey_core::{LockName, OwnerContextId, OwnerToken};
use latchkey_domain::LockState;

use crate::lock_ports::BackendState;

/// Proof of a successful acquisition, required to release the lock.
///
/// Handles are not `Clone`: passing one to another context is an explicit
/// move. Reentrant acquisitions by the same owner context receive handles
/// that share the identity of the original hold, but each handle releases at
/// most one hold.
///
/// Dropping a handle does not release it; the lock stays held and renewed
/// until released. [`LockedExecutor`](crate::LockedExecutor) scopes holds to a
/// call.
#[derive(Debug)]
pub struct LockHandle {
    lock_name: LockName,
    owner_token: OwnerToken,
    owner: OwnerContextId,
    lease_time: Duration,
    acquired_at: DateTime<Utc>,
    backend_state: BackendState,
    acquired_state: LockState,
    released: AtomicBool,
    hold_released: Arc<AtomicBool>,
}

impl LockHandle {
    pub(crate) fn new(
        lock_name: LockName,
        owner_token: OwnerToken,
        owner: OwnerContextId,
        lease_time: Duration,
        backend_state: BackendState,
        acquired_state: LockState,
    ) -> Self {
        Self {
            lock_name,
            owner_token,
            owner,
            lease_time,
            acquired_at: Utc::now(),
            backend_state,
            acquired_state,
            released: AtomicBool::new(false),
            hold_released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Issues another handle for the same underlying hold.
    pub(crate) fn reissue(&self) -> Self {
        Self {
            lock_name: self.lock_name.clone(),
            owner_token: self.owner_token.clone(),
            owner: self.owner.clone(),
            lease_time: self.lease_time,
            acquired_at: self.acquired_at,
            backend_state: self.backend_state.clone(),
            acquired_state: self.acquired_state,
            released: AtomicBool::new(false),
            hold_released: Arc::clone(&self.hold_released),
        }
    }

    /// Marks this handle spent. Returns false if it already was.
    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Marks the underlying hold, shared by every reissued handle, released.
    pub(crate) fn mark_hold_released(&self) {
        self.hold_released.store(true, Ordering::Release);
    }

    /// Returns the lock name.
    #[must_use]
    pub fn lock_name(&self) -> &LockName {
        &self.lock_name
    }

    /// Returns the per-acquisition ownership token.
    #[must_use]
    pub fn owner_token(&self) -> &OwnerToken {
        &self.owner_token
    }

    /// Returns the owner context that acquired the lock.
    #[must_use]
    pub fn owner(&self) -> &OwnerContextId {
        &self.owner
    }

    /// Returns the lease time requested at acquisition.
    #[must_use]
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Returns when the underlying backend acquisition succeeded.
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// Returns backend-specific state captured at acquisition.
    #[must_use]
    pub fn backend_state(&self) -> &BackendState {
        &self.backend_state
    }

    /// Returns whether this handle was released or the hold behind it was
    /// fully released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire) || self.hold_released.load(Ordering::Acquire)
    }

    /// Returns the lifecycle state of the hold as seen through this handle.
    #[must_use]
    pub fn state(&self) -> LockState {
        if self.is_released() {
            LockState::Released
        } else {
            self.acquired_state
        }
    }
}
