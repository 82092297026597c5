//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod lease_policy;
mod lock_state;

pub use lease_policy::{
    DEFAULT_RENEWAL_DIVISOR, LeasePolicy, MIN_RENEWAL_PERIOD, renewal_period,
};
pub use lock_state::LockState;
