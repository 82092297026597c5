use std::time::Duration;

use latchkey_core::{AppError, AppResult};

/// Renewal fires this many times per lease so that one delayed or dropped
/// renewal still leaves another before expiry.
pub const DEFAULT_RENEWAL_DIVISOR: u32 = 3;

/// Lower bound for the renewal period of very short leases.
pub const MIN_RENEWAL_PERIOD: Duration = Duration::from_millis(1);

/// Returns the interval between renewals of a lease of `lease_time`.
#[must_use]
pub fn renewal_period(lease_time: Duration, divisor: u32) -> Duration {
    (lease_time / divisor.max(1)).max(MIN_RENEWAL_PERIOD)
}

/// Lease and wait budget for one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    lease_time: Duration,
    wait_time: Duration,
}

impl LeasePolicy {
    /// Creates a validated policy. The lease must be non-zero; a zero wait
    /// means a single attempt.
    pub fn new(lease_time: Duration, wait_time: Duration) -> AppResult<Self> {
        if lease_time.is_zero() {
            return Err(AppError::Validation(
                "lock lease time must be greater than zero".to_owned(),
            ));
        }

        Ok(Self {
            lease_time,
            wait_time,
        })
    }

    /// Returns the lease duration.
    #[must_use]
    pub fn lease_time(&self) -> Duration {
        self.lease_time
    }

    /// Returns the maximum polling duration.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        self.wait_time
    }

    /// Returns the interval between renewals for this lease.
    #[must_use]
    pub fn renewal_period(&self, divisor: u32) -> Duration {
        renewal_period(self.lease_time, divisor)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::{DEFAULT_RENEWAL_DIVISOR, LeasePolicy, MIN_RENEWAL_PERIOD};

    #[test]
    fn zero_lease_is_rejected() {
        assert!(LeasePolicy::new(Duration::ZERO, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn zero_wait_is_allowed() {
        assert!(LeasePolicy::new(Duration::from_secs(1), Duration::ZERO).is_ok());
    }

    #[test]
    fn renewal_period_is_a_third_of_the_lease() {
        let policy = LeasePolicy::new(Duration::from_millis(30_000), Duration::from_millis(3_000));
        assert!(policy.is_ok());
        let policy = policy.unwrap_or_else(|_| unreachable!());

        assert_eq!(
            policy.renewal_period(DEFAULT_RENEWAL_DIVISOR),
            Duration::from_millis(10_000)
        );
    }

    #[test]
    fn renewal_period_tolerates_zero_divisor() {
        let policy = LeasePolicy::new(Duration::from_millis(90), Duration::ZERO);
        assert!(policy.is_ok());
        let policy = policy.unwrap_or_else(|_| unreachable!());

        assert_eq!(policy.renewal_period(0), Duration::from_millis(90));
    }

    proptest! {
        #[test]
        fn at_least_two_renewals_fit_in_a_lease(lease_ms in 1_u64..10_000_000) {
            let policy = LeasePolicy::new(Duration::from_millis(lease_ms), Duration::ZERO);
            prop_assert!(policy.is_ok());
            let policy = policy.unwrap_or_else(|_| unreachable!());
            let period = policy.renewal_period(DEFAULT_RENEWAL_DIVISOR);

            prop_assert!(period >= MIN_RENEWAL_PERIOD);
            if lease_ms >= 3 {
                prop_assert!(period * 2 < policy.lease_time());
            }
        }
    }
}
