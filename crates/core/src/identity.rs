use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppError, AppResult};

/// Validated name of a contested resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockName(String);

impl LockName {
    /// Creates a lock name, rejecting empty or whitespace-only values.
    pub fn new(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation(
                "lock name must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(value))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for LockName {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

impl From<LockName> for String {
    fn from(value: LockName) -> Self {
        value.0
    }
}

/// Per-attempt secret proving ownership of a lock to its backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generates a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for OwnerToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Identity of the logical execution context that owns reentrant holds.
///
/// Callers pass this explicitly so that hold counts follow the unit of work,
/// not whichever thread or task happens to poll it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerContextId(String);

impl OwnerContextId {
    /// Creates a random owner context identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Creates an owner context identifier from a caller-chosen label.
    pub fn from_label(label: impl Into<String>) -> AppResult<Self> {
        let label = label.into();
        if label.trim().is_empty() {
            return Err(AppError::Validation(
                "owner context label must not be empty or whitespace".to_owned(),
            ));
        }

        Ok(Self(label))
    }

    /// Returns the underlying string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for OwnerContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for OwnerContextId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{LockName, OwnerContextId, OwnerToken};

    #[test]
    fn lock_name_rejects_whitespace() {
        assert!(LockName::new("   ").is_err());
        assert!(LockName::new("job:42").is_ok());
    }

    #[test]
    fn owner_tokens_are_unique_per_attempt() {
        let first = OwnerToken::generate();
        let second = OwnerToken::generate();
        assert_ne!(first, second);
        assert_eq!(first.as_str().len(), 36);
    }

    #[test]
    fn owner_context_label_is_preserved() {
        let owner = OwnerContextId::from_label("worker-7");
        assert!(owner.is_ok());
        assert_eq!(
            owner.map(|value| value.to_string()).unwrap_or_default(),
            "worker-7"
        );
        assert!(OwnerContextId::from_label("").is_err());
    }
}
