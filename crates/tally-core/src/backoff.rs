//! Capped exponential backoff.

use std::time::Duration;

/// Delay schedule `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        // 2^31 already saturates any practical base.
        let factor = 1u32 << attempt.min(31);
        self.base.saturating_mul(factor).min(self.max)
    }
}
