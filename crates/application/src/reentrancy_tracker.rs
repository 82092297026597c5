use std::sync::Arc;

use dashmap::DashMap;
use latchkey_core::{AppError, AppResult, LockName, OwnerContextId};
use tokio::sync::Mutex;

use crate::lock_handle::LockHandle;

/// Hold count of one owner context on one lock.
#[derive(Debug)]
pub(crate) struct ReentrancyEntry {
    hold_count: u32,
    handle: LockHandle,
}

impl ReentrancyEntry {
    pub(crate) fn new(handle: LockHandle) -> Self {
        Self {
            hold_count: 1,
            handle,
        }
    }

    pub(crate) fn hold_count(&self) -> u32 {
        self.hold_count
    }

    pub(crate) fn handle(&self) -> &LockHandle {
        &self.handle
    }

    pub(crate) fn increment(&mut self) -> AppResult<u32> {
        self.hold_count = self.hold_count.checked_add(1).ok_or_else(|| {
            AppError::Internal(format!(
                "hold count overflow for lock '{}'",
                self.handle.lock_name()
            ))
        })?;
        Ok(self.hold_count)
    }

    pub(crate) fn decrement(&mut self) -> u32 {
        self.hold_count = self.hold_count.saturating_sub(1);
        self.hold_count
    }
}

/// Slot guarding one (owner context, lock name) pair. The entry is `Some`
/// exactly while the owner context holds the lock.
pub(crate) type ReentrancySlot = Arc<Mutex<Option<ReentrancyEntry>>>;

type SlotKey = (OwnerContextId, LockName);

/// Owner-context-scoped hold counts.
///
/// Each (owner, name) pair has its own async mutex, held for the whole
/// acquire or release so two calls from one context cannot both observe
/// count zero. Unrelated pairs never contend.
#[derive(Default)]
pub(crate) struct ReentrancyTracker {
    slots: DashMap<SlotKey, ReentrancySlot>,
}

impl ReentrancyTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Returns the slot for the pair, creating an empty one when absent.
    pub(crate) fn slot(&self, owner: &OwnerContextId, lock_name: &LockName) -> ReentrancySlot {
        let slot = self
            .slots
            .entry((owner.clone(), lock_name.clone()))
            .or_default();
        Arc::clone(slot.value())
    }

    /// Returns the slot for the pair without creating one.
    pub(crate) fn existing_slot(
        &self,
        owner: &OwnerContextId,
        lock_name: &LockName,
    ) -> Option<ReentrancySlot> {
        self.slots
            .get(&(owner.clone(), lock_name.clone()))
            .map(|slot| Arc::clone(slot.value()))
    }

    /// Hands a slot back, dropping it from the table once it is empty and no
    /// other caller is waiting on it.
    pub(crate) fn finish(&self, owner: &OwnerContextId, lock_name: &LockName, slot: ReentrancySlot) {
        drop(slot);
        self.slots
            .remove_if(&(owner.clone(), lock_name.clone()), |_, slot| {
                Arc::strong_count(slot) == 1
                    && slot.try_lock().is_ok_and(|entry| entry.is_none())
            });
    }

    /// Returns how many times the owner context currently holds the lock.
    pub(crate) async fn hold_count(&self, owner: &OwnerContextId, lock_name: &LockName) -> u32 {
        let Some(slot) = self.existing_slot(owner, lock_name) else {
            return 0;
        };

        let count = slot
            .lock()
            .await
            .as_ref()
            .map_or(0, ReentrancyEntry::hold_count);
        self.finish(owner, lock_name, slot);
        count
    }

    #[cfg(test)]
    pub(crate) fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
