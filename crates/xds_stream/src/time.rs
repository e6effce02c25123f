//! Monotonic time sources
//!
//! Everything in the engine reads time through [`TimeSource`] so the token
//! bucket and failure tracker can be driven deterministically in tests.
//! Timestamps are `tokio::time::Instant`, which also follows tokio's paused
//! clock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Source of monotonic timestamps
pub trait TimeSource: Send + Sync {
    fn monotonic_time(&self) -> Instant;
}

/// Reads the tokio clock
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimeSource;

impl TimeSource for TokioTimeSource {
    fn monotonic_time(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when advanced explicitly
#[derive(Debug)]
pub struct ManualTimeSource {
    base: Instant,
    offset_nanos: AtomicU64,
}

impl ManualTimeSource {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset_nanos: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.offset_nanos.fetch_add(nanos, Ordering::SeqCst);
    }
}

impl Default for ManualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for ManualTimeSource {
    fn monotonic_time(&self) -> Instant {
        self.base + Duration::from_nanos(self.offset_nanos.load(Ordering::SeqCst))
    }
}
