//! Re-armable single-shot timers
//!
//! A [`Timer`] is a deadline owned by the stream manager. Arming it replaces
//! any pending deadline of the same timer; the event loop awaits
//! [`Timer::expired`] and disables the timer before running its task.
//!
//! Deadlines are always taken from the tokio clock, the same clock
//! [`Timer::expired`] sleeps on, whatever [`TimeSource`](crate::TimeSource)
//! the manager was built with.

use std::time::Duration;
use tokio::time::Instant;

/// Stand-in deadline for delays too large to represent (about 30 years)
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Single-shot scheduled task slot
#[derive(Debug, Default)]
pub struct Timer {
    deadline: Option<Instant>,
}

impl Timer {
    pub fn new() -> Self {
        Self { deadline: None }
    }

    /// Schedule expiry `delay` from now, replacing any pending deadline
    pub fn enable(&mut self, delay: Duration) {
        let now = Instant::now();
        self.deadline = Some(now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE));
    }

    /// Time left until expiry, zero once the deadline has passed
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn disable(&mut self) {
        self.deadline = None;
    }

    pub fn enabled(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves once the deadline passes. Never resolves while disabled.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => futures::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_enable_replaces_pending_deadline() {
        let now = Instant::now();
        let mut timer = Timer::new();
        assert!(!timer.enabled());

        timer.enable(Duration::from_secs(5));
        timer.enable(Duration::from_secs(1));
        assert_eq!(timer.deadline(), Some(now + Duration::from_secs(1)));
        assert_eq!(timer.remaining(), Some(Duration::from_secs(1)));

        timer.disable();
        assert!(!timer.enabled());
        assert_eq!(timer.deadline(), None);
        assert_eq!(timer.remaining(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_delay_is_clamped() {
        let now = Instant::now();
        let mut timer = Timer::new();
        timer.enable(Duration::MAX);
        assert_eq!(timer.deadline(), Some(now + FAR_FUTURE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_waits_for_deadline() {
        let start = Instant::now();
        let mut timer = Timer::new();
        timer.enable(Duration::from_millis(750));

        timer.expired().await;
        assert!(Instant::now() - start >= Duration::from_millis(750));
        assert_eq!(timer.remaining(), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timer_never_expires() {
        let timer = Timer::new();
        let result = tokio::time::timeout(Duration::from_secs(3600), timer.expired()).await;
        assert!(result.is_err());
    }
}
