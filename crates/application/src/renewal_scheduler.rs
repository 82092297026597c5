use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use latchkey_core::{LockName, OwnerToken};
use latchkey_domain::renewal_period;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use crate::lock_handle::LockHandle;
use crate::lock_ports::LockBackend;

struct RenewalTask {
    owner_token: OwnerToken,
    join_handle: JoinHandle<()>,
}

/// Keeps leases of outstanding locks alive until they are released.
///
/// One background task per lock name renews the lease every
/// `lease_time / divisor`. Failed renewals are logged and the next tick tries
/// again; when the backend reports that ownership was lost the task stops and
/// the lease is left to lapse.
pub struct RenewalScheduler {
    backend: Arc<dyn LockBackend>,
    divisor: u32,
    tasks: Arc<DashMap<LockName, RenewalTask>>,
}

impl RenewalScheduler {
    /// Creates a scheduler renewing through the given backend.
    #[must_use]
    pub fn new(backend: Arc<dyn LockBackend>, divisor: u32) -> Self {
        Self {
            backend,
            divisor: divisor.max(1),
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Returns the renewal period used for the given lease.
    #[must_use]
    pub fn period_for(&self, lease_time: Duration) -> Duration {
        renewal_period(lease_time, self.divisor)
    }

    /// Starts renewing the lease behind `handle`.
    pub fn schedule(&self, handle: &LockHandle) {
        let period = self.period_for(handle.lease_time());
        let backend = Arc::clone(&self.backend);
        let tasks = Arc::clone(&self.tasks);
        let lock_name = handle.lock_name().clone();
        let owner_token = handle.owner_token().clone();
        let backend_state = handle.backend_state().clone();
        let lease_time = handle.lease_time();
        let (ready_sender, ready_receiver) = oneshot::channel::<()>();

        let task_lock_name = lock_name.clone();
        let task_owner_token = owner_token.clone();
        let join_handle = tokio::spawn(async move {
            if ready_receiver.await.is_err() {
                return;
            }

            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match backend
                    .renew(
                        &task_lock_name,
                        &task_owner_token,
                        &backend_state,
                        lease_time,
                    )
                    .await
                {
                    Ok(true) => {
                        trace!(lock_name = %task_lock_name, "lock lease renewed");
                    }
                    Ok(false) => {
                        warn!(
                            lock_name = %task_lock_name,
                            backend = backend.backend_name(),
                            "lock is no longer owned, stopping lease renewal"
                        );
                        tasks.remove_if(&task_lock_name, |_, task| {
                            task.owner_token == task_owner_token
                        });
                        return;
                    }
                    Err(error) => {
                        warn!(
                            lock_name = %task_lock_name,
                            backend = backend.backend_name(),
                            error = %error,
                            "failed to renew lock lease"
                        );
                    }
                }
            }
        });

        if let Some(previous) = self.tasks.insert(
            lock_name.clone(),
            RenewalTask {
                owner_token,
                join_handle,
            },
        ) {
            warn!(lock_name = %lock_name, "replacing stale lease renewal task");
            previous.join_handle.abort();
        }

        if ready_sender.send(()).is_err() {
            warn!(lock_name = %lock_name, "lease renewal task exited before start");
        }

        debug!(
            lock_name = %lock_name,
            period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX),
            "lease renewal scheduled"
        );
    }

    /// Stops renewal for the lock if it belongs to `owner_token`.
    ///
    /// Waits for the task to terminate, so no renewal fires after this
    /// returns. Returns false when no matching task was registered.
    pub async fn cancel(&self, lock_name: &LockName, owner_token: &OwnerToken) -> bool {
        let Some((_, task)) = self
            .tasks
            .remove_if(lock_name, |_, task| &task.owner_token == owner_token)
        else {
            return false;
        };

        stop_task(lock_name, task).await;
        debug!(lock_name = %lock_name, "lease renewal cancelled");
        true
    }

    /// Stops every outstanding renewal task.
    pub async fn cancel_all(&self) -> usize {
        let lock_names: Vec<LockName> = self.tasks.iter().map(|task| task.key().clone()).collect();
        let mut cancelled = 0_usize;

        for lock_name in lock_names {
            if let Some((_, task)) = self.tasks.remove(&lock_name) {
                stop_task(&lock_name, task).await;
                cancelled = cancelled.saturating_add(1);
            }
        }

        cancelled
    }

    /// Returns whether a renewal task is registered for the lock.
    #[must_use]
    pub fn is_scheduled(&self, lock_name: &LockName) -> bool {
        self.tasks.contains_key(lock_name)
    }

    /// Returns the number of registered renewal tasks.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Drop for RenewalScheduler {
    fn drop(&mut self) {
        for task in self.tasks.iter() {
            task.join_handle.abort();
        }
    }
}

async fn stop_task(lock_name: &LockName, task: RenewalTask) {
    task.join_handle.abort();
    match task.join_handle.await {
        Ok(()) => {}
        Err(error) if error.is_cancelled() => {}
        Err(error) => {
            warn!(
                lock_name = %lock_name,
                error = %error,
                "lease renewal task ended abnormally"
            );
        }
    }
}
