//! Retry pacing for control calls which must eventually succeed
use std::time::Duration;

use rand::Rng;

/// Exponential backoff with random jitter.
///
/// Delays double from `base` up to `cap`; each delay is jittered by up
/// to 50% to avoid workers retrying in lockstep after a controller
/// restart.
#[derive(Debug, Clone)]
pub(crate) struct RetryPolicy {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl RetryPolicy {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next delay to wait before retrying
    pub(crate) fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        if capped < self.cap {
            self.attempt += 1;
        }
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        capped.mul_f64(jitter)
    }

    /// Reset after a successful call
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}
