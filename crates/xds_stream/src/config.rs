//! Configuration for the control-plane stream
//!
//! Retry bounds are fixed for this engine. The same maximum delay doubles as
//! the window in which repeated identical close failures are kept quiet.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// TODO: make the retry bounds configurable (the failure dedup window would
// need its own setting at the same time).
/// First retry delay after a failure.
pub const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(500);
/// Upper bound on the retry delay; do not cross more than 30s.
pub const RETRY_MAX_DELAY: Duration = Duration::from_millis(30_000);

/// Default bucket size when rate limiting is enabled.
pub const DEFAULT_RATE_LIMIT_MAX_TOKENS: u32 = 100;
/// Default refill rate (tokens per second) when rate limiting is enabled.
pub const DEFAULT_RATE_LIMIT_FILL_RATE: f64 = 10.0;

/// Token bucket settings for outbound discovery requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Whether outbound requests are rate limited at all
    pub enabled: bool,
    /// Maximum number of tokens held by the bucket
    pub max_tokens: u32,
    /// Tokens added per second
    pub fill_rate: f64,
}

impl RateLimitSettings {
    /// Enabled settings with the given bucket size and refill rate
    pub fn enabled(max_tokens: u32, fill_rate: f64) -> Self {
        Self {
            enabled: true,
            max_tokens,
            fill_rate,
        }
    }

    /// Check the settings are usable for a token bucket
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::ZeroMaxTokens);
        }
        if !self.fill_rate.is_finite() || self.fill_rate <= 0.0 {
            return Err(ConfigError::InvalidFillRate {
                fill_rate: self.fill_rate,
            });
        }
        Ok(())
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: DEFAULT_RATE_LIMIT_MAX_TOKENS,
            fill_rate: DEFAULT_RATE_LIMIT_FILL_RATE,
        }
    }
}
