//! Backend-agnostic lock coordination services and ports.

#![forbid(unsafe_code)]

mod lock_coordinator;
mod lock_handle;
mod lock_ports;
mod lock_settings;
mod locked_execution;
mod reentrancy_tracker;
mod renewal_scheduler;

#[cfg(test)]
mod test_support;

pub use lock_coordinator::LockCoordinator;
pub use lock_handle::LockHandle;
pub use lock_ports::{BackendState, LockBackend};
pub use lock_settings::LockSettings;
pub use locked_execution::{
    CallContext, DefaultLockFailStrategy, FailureOutcome, FallbackValueStrategy,
    LockFailStrategy, LockRequest, LockedExecutor,
};
pub use renewal_scheduler::RenewalScheduler;
