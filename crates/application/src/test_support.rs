use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use latchkey_core::{AppError, AppResult, LockName, OwnerContextId, OwnerToken};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::lock_ports::{BackendState, LockBackend};

pub(crate) fn lock_name(value: &str) -> LockName {
    LockName::new(value).unwrap_or_else(|_| unreachable!())
}

pub(crate) fn owner(label: &str) -> OwnerContextId {
    OwnerContextId::from_label(label).unwrap_or_else(|_| unreachable!())
}

struct FakeEntry {
    owner_token: String,
    expires_at: Instant,
}

/// TTL key-value backend that counts every call it receives.
pub(crate) struct FakeLockBackend {
    entries: Mutex<HashMap<String, FakeEntry>>,
    coordinator_reentrancy: bool,
    renewal: bool,
    failing_acquires: AtomicUsize,
    fail_releases: AtomicBool,
    fail_renewals: AtomicBool,
    acquire_calls: AtomicUsize,
    successful_acquires: AtomicUsize,
    release_calls: AtomicUsize,
    successful_releases: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl FakeLockBackend {
    pub(crate) fn new(coordinator_reentrancy: bool, renewal: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            coordinator_reentrancy,
            renewal,
            failing_acquires: AtomicUsize::new(0),
            fail_releases: AtomicBool::new(false),
            fail_renewals: AtomicBool::new(false),
            acquire_calls: AtomicUsize::new(0),
            successful_acquires: AtomicUsize::new(0),
            release_calls: AtomicUsize::new(0),
            successful_releases: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_next_acquires(&self, count: usize) {
        self.failing_acquires.store(count, Ordering::SeqCst);
    }

    pub(crate) fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_renewals(&self, fail: bool) {
        self.fail_renewals.store(fail, Ordering::SeqCst);
    }

    /// Simulates the lock expiring and being taken by someone else.
    pub(crate) async fn steal(&self, lock_name: &LockName) {
        self.entries.lock().await.insert(
            lock_name.as_str().to_owned(),
            FakeEntry {
                owner_token: "intruder".to_owned(),
                expires_at: Instant::now() + Duration::from_secs(3600),
            },
        );
    }

    pub(crate) async fn is_locked(&self, lock_name: &LockName) -> bool {
        self.entries
            .lock()
            .await
            .get(lock_name.as_str())
            .is_some_and(|entry| entry.expires_at > Instant::now())
    }

    pub(crate) fn acquire_calls(&self) -> usize {
        self.acquire_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn successful_acquires(&self) -> usize {
        self.successful_acquires.load(Ordering::SeqCst)
    }

    pub(crate) fn release_calls(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn successful_releases(&self) -> usize {
        self.successful_releases.load(Ordering::SeqCst)
    }

    pub(crate) fn renew_calls(&self) -> usize {
        self.renew_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockBackend for FakeLockBackend {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn acquire(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        lease_time: Duration,
        _wait_time: Duration,
    ) -> AppResult<Option<BackendState>> {
        self.acquire_calls.fetch_add(1, Ordering::SeqCst);

        let remaining_failures = self.failing_acquires.load(Ordering::SeqCst);
        if remaining_failures > 0 {
            self.failing_acquires
                .store(remaining_failures - 1, Ordering::SeqCst);
            return Err(AppError::BackendUnavailable(
                "fake backend connection refused".to_owned(),
            ));
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries
            .get(lock_name.as_str())
            .is_some_and(|entry| entry.expires_at > now)
        {
            return Ok(None);
        }

        entries.insert(
            lock_name.as_str().to_owned(),
            FakeEntry {
                owner_token: owner_token.as_str().to_owned(),
                expires_at: now + lease_time,
            },
        );
        self.successful_acquires.fetch_add(1, Ordering::SeqCst);
        Ok(Some(BackendState::empty()))
    }

    async fn release(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
    ) -> AppResult<bool> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(AppError::BackendUnavailable(
                "fake backend connection reset".to_owned(),
            ));
        }

        let mut entries = self.entries.lock().await;
        let owned = entries
            .get(lock_name.as_str())
            .is_some_and(|entry| entry.owner_token == owner_token.as_str());
        if owned {
            entries.remove(lock_name.as_str());
            self.successful_releases.fetch_add(1, Ordering::SeqCst);
        }

        Ok(owned)
    }

    async fn renew(
        &self,
        lock_name: &LockName,
        owner_token: &OwnerToken,
        _state: &BackendState,
        lease_time: Duration,
    ) -> AppResult<bool> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(AppError::BackendUnavailable(
                "fake backend timed out".to_owned(),
            ));
        }

        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(lock_name.as_str()) {
            Some(entry) if entry.owner_token == owner_token.as_str() && entry.expires_at > now => {
                entry.expires_at = now + lease_time;
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
