use std::sync::Arc;
use std::time::Duration;

use latchkey_core::{AppError, AppResult, LockName, OwnerContextId, OwnerToken};
use latchkey_domain::{LeasePolicy, LockState};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lock_handle::LockHandle;
use crate::lock_ports::LockBackend;
use crate::lock_settings::LockSettings;
use crate::reentrancy_tracker::{ReentrancyEntry, ReentrancyTracker};
use crate::renewal_scheduler::RenewalScheduler;


/// Backend-agnostic distributed lock coordinator.
///
/// Polls the backend until a lock is acquired or the wait budget runs out,
/// tracks reentrant holds per owner context when the backend has no native
/// reentrancy, and keeps leases alive while locks are held.
#[derive(Clone)]
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    settings: LockSettings,
    reentrancy: Arc<ReentrancyTracker>,
    renewals: Arc<RenewalScheduler>,
}

impl LockCoordinator {
    /// Creates a coordinator with default settings.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>) -> Self {
        let settings = LockSettings::default();
        let renewals = Arc::new(RenewalScheduler::new(
            Arc::clone(&backend),
            settings.renewal_divisor,
        ));

        Self {
            backend,
            settings,
            reentrancy: Arc::new(ReentrancyTracker::new()),
            renewals,
        }
    }

    /// Creates a coordinator with validated custom settings.
    pub fn with_settings(backend: Arc<dyn LockBackend>, settings: LockSettings) -> AppResult<Self> {
        settings.validate()?;
        let renewals = Arc::new(RenewalScheduler::new(
            Arc::clone(&backend),
            settings.renewal_divisor,
        ));

        Ok(Self {
            backend,
            settings,
            reentrancy: Arc::new(ReentrancyTracker::new()),
            renewals,
        })
    }

    /// Returns the coordinator settings.
    #[must_use]
    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    /// Returns the renewal scheduler backing this coordinator.
    #[must_use]
    pub fn renewals(&self) -> &RenewalScheduler {
        &self.renewals
    }

    fn tracks_reentrancy(&self) -> bool {
        self.backend.supports_owner_scoped_reentrancy()
    }

    /// Attempts to acquire `lock_name` for `owner`, polling for up to
    /// `wait_time`.
    ///
    /// Returns `Ok(None)` when the wait budget ran out. A context that already
    /// holds the lock gets another handle for the same hold without a
    /// backend call.
    pub async fn try_acquire(
        &self,
        owner: &OwnerContextId,
        lock_name: &LockName,
        lease_time: Duration,
        wait_time: Duration,
    ) -> AppResult<Option<LockHandle>> {
        let policy = LeasePolicy::new(lease_time, wait_time)?;

        if !self.tracks_reentrancy() {
            return self.poll_backend(owner, lock_name, policy).await;
        }

        let slot = self.reentrancy.slot(owner, lock_name);
        let mut entry = slot.lock().await;
        let outcome = if let Some(held) = entry.as_mut() {
            held.increment().map(|hold_count| {
                debug!(
                    lock_name = %lock_name,
                    owner = %owner,
                    hold_count,
                    "reentrant lock acquisition"
                );
                Some(held.handle().reissue())
            })
        } else {
            let acquired = self.poll_backend(owner, lock_name, policy).await;
            if let Ok(Some(handle)) = &acquired {
                *entry = Some(ReentrancyEntry::new(handle.reissue()));
            }
            acquired
        };
        drop(entry);
        self.reentrancy.finish(owner, lock_name, slot);

        outcome
    }

    async fn poll_backend(
        &self,
        owner: &OwnerContextId,
        lock_name: &LockName,
        policy: LeasePolicy,
    ) -> AppResult<Option<LockHandle>> {
        let owner_token = OwnerToken::generate();
        let started_at = Instant::now();
        let deadline = started_at.checked_add(policy.wait_time()).ok_or_else(|| {
            AppError::Validation(format!(
                "lock wait time for '{lock_name}' is too large"
            ))
        })?;
        let polling = LockState::Idle.transition(LockState::Polling)?;
        let mut attempts = 0_u32;

        loop {
            attempts = attempts.saturating_add(1);
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self
                .backend
                .acquire(lock_name, &owner_token, policy.lease_time(), remaining)
                .await
            {
                Ok(Some(backend_state)) => {
                    let handle = LockHandle::new(
                        lock_name.clone(),
                        owner_token,
                        owner.clone(),
                        policy.lease_time(),
                        backend_state,
                        polling.transition(LockState::Held)?,
                    );

                    if self.backend.supports_renewal() {
                        self.renewals.schedule(&handle);
                    }

                    debug!(
                        lock_name = %lock_name,
                        owner = %owner,
                        backend = self.backend.backend_name(),
                        attempts,
                        "lock acquired"
                    );
                    return Ok(Some(handle));
                }
                Ok(None) => {
                    debug!(
                        lock_name = %lock_name,
                        owner = %owner,
                        attempt = attempts,
                        "lock is held elsewhere"
                    );
                }
                Err(error) => {
                    warn!(
                        lock_name = %lock_name,
                        owner = %owner,
                        backend = self.backend.backend_name(),
                        attempt = attempts,
                        error = %error,
                        "lock acquisition attempt failed"
                    );
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                info!(
                    lock_name = %lock_name,
                    owner = %owner,
                    attempts,
                    waited_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "timed out waiting for lock"
                );
                return Ok(None);
            }

            tokio::time::sleep(self.settings.retry_interval.min(remaining)).await;
        }
    }

    /// Releases one hold represented by `handle`.
    ///
    /// Returns `Ok(true)` when the hold was released (or a reentrant hold was
    /// decremented), and `Ok(false)` when the handle was already released or
    /// the backend could not confirm the release. Releasing a lock the owner
    /// context does not hold is an [`AppError::LockNotHeld`] error.
    pub async fn release(&self, handle: &LockHandle) -> AppResult<bool> {
        if handle.is_released() {
            debug!(
                lock_name = %handle.lock_name(),
                owner = %handle.owner(),
                "lock handle already released"
            );
            return Ok(false);
        }

        if !self.tracks_reentrancy() {
            if !handle.mark_released() {
                return Ok(false);
            }
            handle.mark_hold_released();
            return Ok(self.release_in_backend(handle).await);
        }

        let owner = handle.owner();
        let lock_name = handle.lock_name();
        let Some(slot) = self.reentrancy.existing_slot(owner, lock_name) else {
            return Err(not_held(owner, lock_name));
        };

        let mut entry = slot.lock().await;
        let outcome = match entry.as_mut() {
            Some(held) if held.handle().owner_token() == handle.owner_token() => {
                if !handle.mark_released() {
                    Ok(false)
                } else {
                    let hold_count = held.decrement();
                    if hold_count > 0 {
                        debug!(
                            lock_name = %lock_name,
                            owner = %owner,
                            hold_count,
                            "reentrant lock hold released"
                        );
                        Ok(true)
                    } else {
                        *entry = None;
                        handle.mark_hold_released();
                        Ok(self.release_in_backend(handle).await)
                    }
                }
            }
            _ if handle.is_released() => Ok(false),
            _ => Err(not_held(owner, lock_name)),
        };
        drop(entry);
        self.reentrancy.finish(owner, lock_name, slot);

        outcome
    }

    /// Releases the lock `owner` holds under `lock_name`.
    ///
    /// Only available when the coordinator tracks reentrancy; the held
    /// identity is looked up from the owner context.
    pub async fn release_named(
        &self,
        owner: &OwnerContextId,
        lock_name: &LockName,
    ) -> AppResult<bool> {
        if !self.tracks_reentrancy() {
            return Err(AppError::Validation(format!(
                "backend '{}' manages reentrancy itself; release lock '{lock_name}' by handle",
                self.backend.backend_name()
            )));
        }

        let handle = {
            let Some(slot) = self.reentrancy.existing_slot(owner, lock_name) else {
                return Err(not_held(owner, lock_name));
            };
            let handle = slot
                .lock()
                .await
                .as_ref()
                .map(|held| held.handle().reissue());
            self.reentrancy.finish(owner, lock_name, slot);
            handle
        };

        match handle {
            Some(handle) => self.release(&handle).await,
            None => Err(not_held(owner, lock_name)),
        }
    }

    async fn release_in_backend(&self, handle: &LockHandle) -> bool {
        let lock_name = handle.lock_name();
        self.renewals.cancel(lock_name, handle.owner_token()).await;

        match self
            .backend
            .release(lock_name, handle.owner_token(), handle.backend_state())
            .await
        {
            Ok(true) => {
                debug!(
                    lock_name = %lock_name,
                    owner = %handle.owner(),
                    "lock released"
                );
                true
            }
            Ok(false) => {
                warn!(
                    lock_name = %lock_name,
                    owner = %handle.owner(),
                    backend = self.backend.backend_name(),
                    "lock was not held by this owner at release"
                );
                false
            }
            Err(error) => {
                warn!(
                    lock_name = %lock_name,
                    owner = %handle.owner(),
                    backend = self.backend.backend_name(),
                    error = %error,
                    "failed to release lock"
                );
                false
            }
        }
    }

    /// Returns how many holds `owner` has on `lock_name`.
    ///
    /// Waits for any in-flight acquire or release by the same owner on the
    /// same lock. Always zero when the backend manages reentrancy.
    pub async fn hold_count(&self, owner: &OwnerContextId, lock_name: &LockName) -> u32 {
        self.reentrancy.hold_count(owner, lock_name).await
    }

    /// Returns whether `owner` currently holds `lock_name`.
    pub async fn is_held_by(&self, owner: &OwnerContextId, lock_name: &LockName) -> bool {
        self.hold_count(owner, lock_name).await > 0
    }

    /// Cancels every outstanding lease renewal. Called on process shutdown.
    pub async fn shutdown(&self) {
        let cancelled = self.renewals.cancel_all().await;
        info!(
            backend = self.backend.backend_name(),
            cancelled_renewals = cancelled,
            "lock coordinator shut down"
        );
    }
}

fn not_held(owner: &OwnerContextId, lock_name: &LockName) -> AppError {
    AppError::LockNotHeld(format!(
        "owner context '{owner}' does not hold lock '{lock_name}'"
    ))
}
