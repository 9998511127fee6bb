//! Failure cooldown policy

use std::time::Duration;

/// Exponential cooldown: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct CooldownPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl CooldownPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Cooldown for a credential that has now failed `consecutive_failures`
    /// times in a row.
    pub fn duration_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(900))
    }
}
