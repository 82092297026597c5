use std::time::Duration;

use latchkey_core::{AppError, AppResult};
use latchkey_domain::DEFAULT_RENEWAL_DIVISOR;

/// Tunables for the lock coordinator.
#[derive(Debug, Clone)]
pub struct LockSettings {
    /// Pause between failed acquisition attempts.
    pub retry_interval: Duration,
    /// Renewals fire every `lease_time / renewal_divisor`.
    pub renewal_divisor: u32,
    /// Lease used when a request does not specify one.
    pub default_lease_time: Duration,
    /// Wait used when a request does not specify one.
    pub default_wait_time: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_millis(100),
            renewal_divisor: DEFAULT_RENEWAL_DIVISOR,
            default_lease_time: Duration::from_secs(30),
            default_wait_time: Duration::from_secs(3),
        }
    }
}

impl LockSettings {
    /// Validates the settings.
    pub fn validate(&self) -> AppResult<()> {
        if self.retry_interval.is_zero() {
            return Err(AppError::Validation(
                "lock retry interval must be greater than zero".to_owned(),
            ));
        }

        if self.renewal_divisor < 2 {
            return Err(AppError::Validation(
                "lock renewal divisor must be at least 2".to_owned(),
            ));
        }

        if self.default_lease_time.is_zero() {
            return Err(AppError::Validation(
                "default lock lease time must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::LockSettings;

    #[test]
    fn default_settings_are_valid() {
        let settings = LockSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.retry_interval, Duration::from_millis(100));
        assert_eq!(settings.renewal_divisor, 3);
    }

    #[test]
    fn zero_retry_interval_is_rejected() {
        let settings = LockSettings {
            retry_interval: Duration::ZERO,
            ..LockSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn divisor_below_two_is_rejected() {
        let settings = LockSettings {
            renewal_divisor: 1,
            ..LockSettings::default()
        };
        assert!(settings.validate().is_err());
    }
}
