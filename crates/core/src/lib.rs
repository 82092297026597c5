//! Shared primitives for all Rust crates in Latchkey.

#![forbid(unsafe_code)]

/// Identifiers naming locks and the parties that hold them.
pub mod identity;

use thiserror::Error;

pub use identity::{LockName, OwnerContextId, OwnerToken};

/// Result type used across Latchkey crates.
pub type AppResult<T> = Result<T, AppError>;

/// Common application error categories.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid input or violated invariant.
    #[error("validation error: {0}")]
    Validation(String),

    /// Coordination backend could not be reached or failed transiently.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Release was requested for a lock the calling context does not hold.
    #[error("lock not held: {0}")]
    LockNotHeld(String),

    /// Lock failure strategy produced a result of the wrong type.
    #[error("callback contract violation: {0}")]
    CallbackContract(String),

    /// Lock could not be acquired for a guarded operation.
    #[error("failed to acquire lock '{lock_name}' for operation '{operation}'")]
    AcquisitionFailed {
        /// Name of the contested lock.
        lock_name: String,
        /// Operation that required the lock.
        operation: String,
    },

    /// Internal unexpected error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Returns true when the error indicates caller misuse rather than contention.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::LockNotHeld(_) | Self::CallbackContract(_))
    }
}

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn misuse_errors_are_flagged() {
        assert!(AppError::LockNotHeld("job:42".to_owned()).is_misuse());
        assert!(AppError::CallbackContract("mismatch".to_owned()).is_misuse());
        assert!(!AppError::BackendUnavailable("down".to_owned()).is_misuse());
    }

    #[test]
    fn acquisition_failed_message_names_lock_and_operation() {
        let error = AppError::AcquisitionFailed {
            lock_name: "job:42".to_owned(),
            operation: "settle".to_owned(),
        };

        assert_eq!(
            error.to_string(),
            "failed to acquire lock 'job:42' for operation 'settle'"
        );
    }
}
