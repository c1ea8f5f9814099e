//! Exponential backoff state.
//!
//! Each persisted key carries its own backoff gating outbound work: one for
//! advertisements and one for TTL refreshes. Reporting an error schedules
//! the next attempt after the current delay and doubles the delay up to the
//! cap; reporting success resets the state so the next attempt may fire
//! immediately.
//!
//! Deadlines are [`tokio::time::Instant`]s so a paused test clock drives
//! the state deterministically.

use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with an initial delay and a cap.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay applied on the first error after a success.
    initial: Duration,

    /// Ceiling on the delay.
    max: Duration,

    /// Delay the next error will schedule.
    current: Duration,

    /// Deadline before which attempts are gated, if any.
    next_attempt: Option<Instant>,
}

impl ExponentialBackoff {
    /// Create a fresh backoff; the first attempt may fire immediately.
    pub fn new(initial: Duration, max: Duration) -> Self {
        debug_assert!(!initial.is_zero(), "initial backoff must be > 0");
        debug_assert!(initial <= max, "initial backoff must not exceed max");
        Self {
            initial,
            max,
            current: initial,
            next_attempt: None,
        }
    }

    /// Check whether an attempt may fire now.
    pub fn can_try_now(&self) -> bool {
        self.next_attempt.map_or(true, |at| Instant::now() >= at)
    }

    /// Gate the next attempt behind the current delay and double the delay,
    /// capped at the maximum.
    pub fn report_error(&mut self) {
        self.next_attempt = Some(Instant::now() + self.current);
        self.current = (self.current * 2).min(self.max);
    }

    /// Reset to the initial delay and lift the gate.
    pub fn report_success(&mut self) {
        self.current = self.initial;
        self.next_attempt = None;
    }

    /// Time remaining until the next attempt may fire; zero when ungated.
    pub fn time_until_retry(&self) -> Duration {
        self.next_attempt
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn fresh_backoff_is_ungated() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        assert!(backoff.can_try_now());
        assert_eq!(backoff.time_until_retry(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn error_schedules_then_doubles() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(400));

        backoff.report_error();
        assert!(!backoff.can_try_now());
        assert_eq!(backoff.time_until_retry(), Duration::from_millis(100));

        advance(Duration::from_millis(100)).await;
        assert!(backoff.can_try_now());

        // Second and third errors wait 200ms and 400ms; the cap holds after.
        backoff.report_error();
        assert_eq!(backoff.time_until_retry(), Duration::from_millis(200));
        advance(Duration::from_millis(200)).await;

        backoff.report_error();
        assert_eq!(backoff.time_until_retry(), Duration::from_millis(400));
        advance(Duration::from_millis(400)).await;

        backoff.report_error();
        assert_eq!(backoff.time_until_retry(), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(400));
        backoff.report_error();
        backoff.report_error();

        backoff.report_success();
        assert!(backoff.can_try_now());
        backoff.report_error();
        assert_eq!(backoff.time_until_retry(), Duration::from_millis(100));
    }
}
