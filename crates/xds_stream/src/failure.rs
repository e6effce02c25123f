//! Close-event log deduplication
//!
//! A flapping management server tends to close the stream with the same
//! status over and over. [`FailureTracker`] remembers the first failure of a
//! run of "noisy" statuses (`Unavailable`, `DeadlineExceeded`, `Internal`) and
//! only escalates it to a warning when the failure mode changes or when it has
//! persisted longer than the dedup window. Every other non-OK status warns
//! immediately.

use std::time::Duration;
use tokio::time::Instant;
use tonic::Code;
use tracing::*;

/// First failure of an unresolved run
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub status: Code,
    pub message: String,
    pub recorded_at: Instant,
}

/// What [`FailureTracker::maybe_log_close`] did with a close event
#[derive(Debug, Clone, PartialEq)]
pub enum CloseLog {
    /// Clean close, logged at debug
    Ok,
    /// Non-noisy failure, logged at warn
    Warned,
    /// First noisy failure of a run, remembered without warning
    Recorded,
    /// Same noisy failure repeating inside the window
    Suppressed,
    /// Failure mode changed: the previous record was logged at warn and
    /// replaced by the new failure
    Replaced { previous: FailureRecord, elapsed: Duration },
    /// Same failure outlived the window: logged at warn and forgotten
    Expired { previous: FailureRecord, elapsed: Duration },
}

impl CloseLog {
    /// Whether this close produced a warning line
    pub fn warned(&self) -> bool {
        matches!(
            self,
            CloseLog::Warned | CloseLog::Replaced { .. } | CloseLog::Expired { .. }
        )
    }
}

/// Remembers the first failure of a run of noisy close statuses
#[derive(Debug, Clone)]
pub struct FailureTracker {
    record: Option<FailureRecord>,
    window: Duration,
}

impl FailureTracker {
    /// `window` is how long an identical failure stays quiet before it is
    /// escalated and forgotten
    pub fn new(window: Duration) -> Self {
        Self {
            record: None,
            window,
        }
    }

    pub fn record(&self) -> Option<&FailureRecord> {
        self.record.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.record.is_some()
    }

    /// Forget any pending failure (clean close, reconnect or message receipt)
    pub fn clear(&mut self) {
        self.record = None;
    }

    /// Log a close event for `method`, deduplicating noisy repeats
    pub fn maybe_log_close(
        &mut self,
        method: &str,
        status: Code,
        message: &str,
        now: Instant,
    ) -> CloseLog {
        if status == Code::Ok {
            debug!("{} gRPC config stream closed: {:?}, {}", method, status, message);
            return CloseLog::Ok;
        }

        if !only_warn_on_repeated_failures(status) {
            warn!("{} gRPC config stream closed: {:?}, {}", method, status, message);
            return CloseLog::Warned;
        }

        debug!("{} gRPC config stream closed: {:?}, {}", method, status, message);

        let Some(previous) = self.record.take() else {
            self.set(status, message, now);
            return CloseLog::Recorded;
        };

        let elapsed = now.saturating_duration_since(previous.recorded_at);

        if previous.status != status {
            warn!(
                "{} gRPC config stream closed {}ms ago: {:?}, {}",
                method,
                elapsed.as_millis(),
                previous.status,
                previous.message
            );
            self.set(status, message, now);
            return CloseLog::Replaced { previous, elapsed };
        }

        // Whole milliseconds, so a close 30000.4ms later still counts as inside.
        if elapsed.as_millis() > self.window.as_millis() {
            warn!(
                "{} gRPC config stream closed {}ms ago: {:?}, {}",
                method,
                elapsed.as_millis(),
                previous.status,
                previous.message
            );
            return CloseLog::Expired { previous, elapsed };
        }

        self.record = Some(previous);
        CloseLog::Suppressed
    }

    fn set(&mut self, status: Code, message: &str, now: Instant) {
        self.record = Some(FailureRecord {
            status,
            message: message.to_string(),
            recorded_at: now,
        });
    }
}

/// Statuses that are expected while a management server restarts or is
/// unreachable; they only warn when they persist or change
pub fn only_warn_on_repeated_failures(status: Code) -> bool {
    matches!(
        status,
        Code::Unavailable | Code::DeadlineExceeded | Code::Internal
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RETRY_MAX_DELAY;

    const METHOD: &str = "envoy.service.discovery.v3.AggregatedDiscoveryService.StreamAggregatedResources";

    fn tracker() -> FailureTracker {
        FailureTracker::new(RETRY_MAX_DELAY)
    }

    #[test]
    fn test_ok_close_logs_without_recording() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert_eq!(tracker.maybe_log_close(METHOD, Code::Ok, "", now), CloseLog::Ok);
        assert!(!tracker.is_set());
    }

    #[test]
    fn test_non_noisy_status_warns_immediately() {
        let mut tracker = tracker();
        let now = Instant::now();
        let outcome = tracker.maybe_log_close(METHOD, Code::PermissionDenied, "denied", now);
        assert_eq!(outcome, CloseLog::Warned);
        assert!(outcome.warned());
        assert!(!tracker.is_set());
    }

    #[test]
    fn test_repeated_unavailable_is_quiet_inside_window() {
        let mut tracker = tracker();
        let start = Instant::now();

        let outcomes = [
            tracker.maybe_log_close(METHOD, Code::Unavailable, "first", start),
            tracker.maybe_log_close(METHOD, Code::Unavailable, "second", start + Duration::from_millis(300)),
            tracker.maybe_log_close(METHOD, Code::Unavailable, "third", start + Duration::from_millis(900)),
        ];

        assert_eq!(outcomes[0], CloseLog::Recorded);
        assert_eq!(outcomes[1], CloseLog::Suppressed);
        assert_eq!(outcomes[2], CloseLog::Suppressed);
        assert!(outcomes.iter().all(|outcome| !outcome.warned()));

        // Only the first failure is remembered.
        let record = tracker.record().unwrap();
        assert_eq!(record.message, "first");
        assert_eq!(record.recorded_at, start);
    }

    #[test]
    fn test_status_change_flushes_previous_record() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.maybe_log_close(METHOD, Code::Unavailable, "down", start);
        tracker.maybe_log_close(METHOD, Code::Unavailable, "down", start + Duration::from_millis(100));

        let later = start + Duration::from_millis(400);
        let outcome = tracker.maybe_log_close(METHOD, Code::DeadlineExceeded, "slow", later);
        match outcome {
            CloseLog::Replaced { previous, elapsed } => {
                assert_eq!(previous.status, Code::Unavailable);
                assert_eq!(previous.message, "down");
                assert_eq!(elapsed, Duration::from_millis(400));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let record = tracker.record().unwrap();
        assert_eq!(record.status, Code::DeadlineExceeded);
        assert_eq!(record.recorded_at, later);
    }

    #[test]
    fn test_same_status_past_window_flushes_and_clears() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.maybe_log_close(METHOD, Code::Internal, "boom", start);

        let at_window = start + RETRY_MAX_DELAY;
        assert_eq!(
            tracker.maybe_log_close(METHOD, Code::Internal, "boom", at_window),
            CloseLog::Suppressed
        );

        let past_window = start + RETRY_MAX_DELAY + Duration::from_millis(1);
        let outcome = tracker.maybe_log_close(METHOD, Code::Internal, "boom", past_window);
        assert!(matches!(outcome, CloseLog::Expired { .. }));
        assert!(outcome.warned());
        assert!(!tracker.is_set());

        // The next failure starts a fresh run.
        assert_eq!(
            tracker.maybe_log_close(METHOD, Code::Internal, "boom", past_window),
            CloseLog::Recorded
        );
    }

    #[test]
    fn test_non_noisy_status_leaves_record_alone() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.maybe_log_close(METHOD, Code::Unavailable, "down", start);
        tracker.maybe_log_close(METHOD, Code::Unauthenticated, "bad token", start);
        assert_eq!(tracker.record().unwrap().status, Code::Unavailable);
    }

    #[test]
    fn test_clear() {
        let mut tracker = tracker();
        tracker.maybe_log_close(METHOD, Code::Unavailable, "down", Instant::now());
        assert!(tracker.is_set());
        tracker.clear();
        assert!(tracker.record().is_none());
    }

    #[test]
    fn test_window_compares_whole_milliseconds() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.maybe_log_close(METHOD, Code::Unavailable, "first", start);

        let just_inside = start + RETRY_MAX_DELAY + Duration::from_micros(400);
        assert_eq!(
            tracker.maybe_log_close(METHOD, Code::Unavailable, "again", just_inside),
            CloseLog::Suppressed
        );
        assert!(tracker.is_set());

        let outside = start + RETRY_MAX_DELAY + Duration::from_millis(1);
        assert!(matches!(
            tracker.maybe_log_close(METHOD, Code::Unavailable, "again", outside),
            CloseLog::Expired { .. }
        ));
        assert!(!tracker.is_set());
    }
}
