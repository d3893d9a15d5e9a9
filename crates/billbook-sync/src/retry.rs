//! # Retry Policy
//!
//! Exponential backoff with jitter between attempts of a RETRY record.
//!
//! ```text
//!   attempt:   1      2      3      4       5
//!   delay:     1s     2s     4s     8s      16s   (× 1 ± jitter, capped)
//!   after the ceiling (default 5 failed attempts) ──► DEAD_LETTER
//! ```
//!
//! Delays are not slept inside the dispatcher. They become the record's
//! `next_attempt_at`, and the record is simply not eligible before then.

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::time::Duration;

use crate::config::RetrySettings;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts allowed in total. Reaching it moves the record to the
    /// dead-letter store instead of RETRY.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            initial_delay: Duration::from_millis(settings.initial_backoff_ms),
            max_delay: Duration::from_secs(settings.max_backoff_secs),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }

    /// Same curve without randomization.
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }

    /// True once `attempts` failed attempts have used up the budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: self.jitter,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut delay = self.initial_delay;
        for _ in 0..attempt.max(1) {
            delay = backoff.next_backoff().unwrap_or(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}
