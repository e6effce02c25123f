//! Jittered exponential backoff for stream re-establishment
//!
//! Each call to [`BackOffStrategy::next_back_off`] doubles the base delay and
//! scales it by a random jitter factor, capped at the configured maximum. The
//! jitter is drawn per call so that many proxies losing the same management
//! server do not reconnect in lockstep.

use rand::{Rng, RngCore};
use std::fmt;
use std::time::Duration;
use tracing::*;

/// Lower bound of the jitter factor applied to each delay
const JITTER_MIN: f64 = 1.0;
/// Upper bound (exclusive) of the jitter factor. Kept below 2.0 so a delay
/// never exceeds the next attempt's unjittered delay.
const JITTER_MAX: f64 = 1.5;

/// Computes successive retry delays
pub trait BackOffStrategy: Send {
    /// Delay before the next attempt; advances the attempt counter
    fn next_back_off(&mut self) -> Duration;

    /// Forget prior failures; the next delay starts from the initial bound
    fn reset(&mut self);
}

/// Exponential backoff with multiplicative jitter, bounded by `max_delay`
pub struct JitteredExponentialBackOff {
    initial_delay: Duration,
    max_delay: Duration,
    attempt: u32,
    random: Box<dyn RngCore + Send>,
}

impl JitteredExponentialBackOff {
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        random: impl RngCore + Send + 'static,
    ) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            attempt: 0,
            random: Box::new(random),
        }
    }

    /// Number of delays handed out since the last reset
    pub fn attempt_count(&self) -> u32 {
        self.attempt
    }

    /// Unjittered delay for the current attempt, capped at the maximum
    fn base_delay(&self) -> Duration {
        // 2^31 * 500ms is far beyond any sane cap; clamp the exponent so the
        // shift cannot overflow.
        let exponent = self.attempt.min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl BackOffStrategy for JitteredExponentialBackOff {
    fn next_back_off(&mut self) -> Duration {
        let base = self.base_delay();
        let jitter = self.random.gen_range(JITTER_MIN..JITTER_MAX);
        let delay = base.mul_f64(jitter).min(self.max_delay);

        // Once the cap is reached further increments change nothing.
        if base < self.max_delay {
            self.attempt += 1;
        }

        trace!("Next backoff delay {:?} (attempt {})", delay, self.attempt);
        delay
    }

    fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Backoff reset after {} attempts", self.attempt);
        }
        self.attempt = 0;
    }
}

impl fmt::Debug for JitteredExponentialBackOff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JitteredExponentialBackOff")
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}
