use latchkey_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Lifecycle of one lock acquisition as observed by its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// No acquisition in progress.
    Idle,
    /// Backend is being polled until success or deadline.
    Polling,
    /// Lock is owned by the caller.
    Held,
    /// Lock was handed back to the backend.
    Released,
}

impl LockState {
    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Polling => "polling",
            Self::Held => "held",
            Self::Released => "released",
        }
    }

    /// Returns whether the state machine allows moving to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Polling)
                | (Self::Polling, Self::Held)
                | (Self::Polling, Self::Idle)
                | (Self::Held, Self::Held)
                | (Self::Held, Self::Released)
        )
    }

    /// Moves to `next`, rejecting transitions the lifecycle does not allow.
    pub fn transition(self, next: Self) -> AppResult<Self> {
        if !self.can_transition_to(next) {
            return Err(AppError::Validation(format!(
                "invalid lock state transition from '{}' to '{}'",
                self.as_str(),
                next.as_str()
            )));
        }

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::LockState;

    fn any_state() -> impl Strategy<Value = LockState> {
        prop_oneof![
            Just(LockState::Idle),
            Just(LockState::Polling),
            Just(LockState::Held),
            Just(LockState::Released),
        ]
    }

    #[test]
    fn acquisition_path_is_accepted() {
        let state = LockState::Idle
            .transition(LockState::Polling)
            .and_then(|state| state.transition(LockState::Held))
            .and_then(|state| state.transition(LockState::Held))
            .and_then(|state| state.transition(LockState::Released));

        assert!(matches!(state, Ok(LockState::Released)));
    }

    #[test]
    fn timeout_returns_to_idle() {
        let state = LockState::Idle
            .transition(LockState::Polling)
            .and_then(|state| state.transition(LockState::Idle));

        assert!(matches!(state, Ok(LockState::Idle)));
    }

    #[test]
    fn released_lock_cannot_be_released_again() {
        assert!(LockState::Released.transition(LockState::Released).is_err());
    }

    proptest! {
        #[test]
        fn released_is_terminal(next in any_state()) {
            prop_assert!(!LockState::Released.can_transition_to(next));
        }

        #[test]
        fn held_is_only_reachable_from_polling_or_held(from in any_state()) {
            let allowed = LockState::Held == from || LockState::Polling == from;
            prop_assert_eq!(from.can_transition_to(LockState::Held), allowed);
        }
    }
}
