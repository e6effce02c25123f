//! Token bucket gating outbound discovery requests
//!
//! The bucket starts full and refills continuously at `fill_rate` tokens per
//! second, never holding more than `max_tokens`. A refused consume never
//! errors; the caller asks [`TokenBucket::next_token_available`] how long to
//! wait and schedules its own retry.

use crate::time::TimeSource;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Continuously refilling token bucket
pub struct TokenBucket {
    /// Max tokens in bucket
    max_tokens: f64,
    /// Tokens added per second
    fill_rate: f64,
    /// Current (fractional) token count
    tokens: f64,
    /// Last time tokens were added
    last_fill: Instant,
    time_source: Arc<dyn TimeSource>,
}

impl TokenBucket {
    pub fn new(max_tokens: u32, fill_rate: f64, time_source: Arc<dyn TimeSource>) -> Self {
        let max_tokens = f64::from(max_tokens);
        Self {
            max_tokens,
            fill_rate: fill_rate.max(0.0),
            tokens: max_tokens,
            last_fill: time_source.monotonic_time(),
            time_source,
        }
    }

    /// Take up to `tokens` tokens, returning how many were granted
    ///
    /// Without `allow_partial` the result is either `tokens` or 0. With it,
    /// as many whole tokens as are available are handed out.
    pub fn consume(&mut self, tokens: u64, allow_partial: bool) -> u64 {
        self.refill();

        let tokens = if allow_partial {
            tokens.min(self.tokens.floor() as u64)
        } else {
            tokens
        };

        if self.tokens < tokens as f64 {
            return 0;
        }
        self.tokens -= tokens as f64;
        tokens
    }

    /// Time until at least one whole token is available
    pub fn next_token_available(&mut self) -> Duration {
        self.refill();
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.fill_rate <= 0.0 {
            return Duration::MAX;
        }

        let seconds = (1.0 - self.tokens) / self.fill_rate;
        // Round up to whole milliseconds so the retry never fires early.
        Duration::from_millis((seconds * 1000.0).ceil() as u64)
    }

    /// Set the bucket to hold `tokens` tokens as of now
    pub fn maybe_reset(&mut self, tokens: u64) {
        self.tokens = (tokens as f64).min(self.max_tokens);
        self.last_fill = self.time_source.monotonic_time();
    }

    /// Whole tokens currently available, without consuming any
    pub fn available(&mut self) -> u64 {
        self.refill();
        self.tokens.floor() as u64
    }

    fn refill(&mut self) {
        let now = self.time_source.monotonic_time();
        if self.tokens < self.max_tokens {
            let elapsed = now.saturating_duration_since(self.last_fill).as_secs_f64();
            self.tokens = (self.tokens + elapsed * self.fill_rate).min(self.max_tokens);
        }
        self.last_fill = now;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("max_tokens", &self.max_tokens)
            .field("fill_rate", &self.fill_rate)
            .field("tokens", &self.tokens)
            .finish_non_exhaustive()
    }
}
