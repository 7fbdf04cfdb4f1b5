//! Exponential backoff for failed reconciliations.
//!
//! A Migration that fails is requeued after a delay that doubles with every
//! consecutive failure, capped at a maximum.
//!
//! # Example
//!
//! ```ignore
//! use virt_migration_controller::retry::BackoffConfig;
//!
//! let backoff = BackoffConfig::default();
//! assert_eq!(backoff.delay_for(0), Duration::from_millis(5));
//! assert_eq!(backoff.delay_for(1), Duration::from_millis(10));
//! ```

use std::time::Duration;

/// Configuration for requeue backoff.
#[derive(Clone, Debug)]
pub struct BackoffConfig {
    /// Delay applied after the first failure
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(crate::DEFAULT_BACKOFF_BASE_MS),
            max_delay: Duration::from_secs(crate::DEFAULT_BACKOFF_MAX_SECS),
        }
    }
}

impl BackoffConfig {
    /// Create a config with the given base and maximum delays
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay for the given number of previous failures, capped at `max_delay`
    pub fn delay_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
