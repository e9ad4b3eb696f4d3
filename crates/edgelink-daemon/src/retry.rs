//! Exponential backoff with jitter.
//!
//! [`BackoffHandler`] limits the number of retries and spaces them out with a
//! randomized, exponentially growing delay. After a connection has proven
//! stable, [`BackoffHandler::set_grace_period`] schedules a full reset of the
//! retry counter once a (also randomized) grace window has elapsed.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Base delay used when none is configured.
pub const DEFAULT_BASE_TIME: Duration = Duration::from_secs(1);

/// Exponential backoff state for one retrying component.
///
/// Not shared between tasks: every connection slot owns its own handler.
#[derive(Debug, Clone)]
pub struct BackoffHandler {
    /// Maximum number of retries. Zero disables retrying unless
    /// `retry_forever` is set.
    max_retries: u32,
    /// Caps the exponent at `max_retries` but keeps retrying indefinitely.
    retry_forever: bool,
    base_time: Duration,
    retries: u32,
    reset_deadline: Option<Instant>,
    rng: StdRng,
}

impl BackoffHandler {
    pub fn new(max_retries: u32, base_time: Duration, retry_forever: bool) -> Self {
        Self {
            max_retries,
            retry_forever,
            base_time,
            retries: 0,
            reset_deadline: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Replace the jitter source, e.g. with a seeded one in tests.
    #[must_use]
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn base_time(&self) -> Duration {
        if self.base_time.is_zero() {
            DEFAULT_BASE_TIME
        } else {
            self.base_time
        }
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Number of retries consumed so far.
    pub const fn retries(&self) -> u32 {
        self.retries
    }

    pub const fn reached_max_retries(&self) -> bool {
        self.retries >= self.max_retries
    }

    pub const fn reset_deadline(&self) -> Option<Instant> {
        self.reset_deadline
    }

    fn reset_due(&self, now: Instant) -> bool {
        self.reset_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Upper bound of the next wait, without consuming a retry.
    ///
    /// Returns `None` when no further retry is allowed or `cancel` has
    /// already fired.
    pub fn max_backoff_duration(
        &self,
        now: Instant,
        cancel: &CancellationToken,
    ) -> Option<Duration> {
        if cancel.is_cancelled() {
            return None;
        }
        // Mirrors `arm`, which would clear the counter first
        if self.reset_due(now) {
            return Some(scaled(self.base_time(), 1));
        }
        if self.reached_max_retries() && !self.retry_forever {
            return None;
        }
        Some(scaled(self.base_time(), self.retries.saturating_add(1)))
    }

    /// Consume a retry and return how long to wait before it.
    ///
    /// `None` means the retry budget is spent: the caller must stop.
    pub fn arm(&mut self, now: Instant) -> Option<Duration> {
        if self.reset_due(now) {
            self.retries = 0;
            self.reset_deadline = None;
        }
        if self.retries >= self.max_retries {
            if !self.retry_forever {
                return None;
            }
        } else {
            self.retries += 1;
        }
        let max_wait = scaled(self.base_time(), self.retries);
        Some(self.jitter(max_wait))
    }

    /// Wait out the next backoff period.
    ///
    /// Returns `false` if retries are exhausted or `cancel` fired first.
    pub async fn backoff(&mut self, cancel: &CancellationToken) -> bool {
        let Some(wait) = self.arm(Instant::now()) else {
            return false;
        };
        tokio::select! {
            () = tokio::time::sleep(wait) => true,
            () = cancel.cancelled() => false,
        }
    }

    /// Reset the retry counter once a randomized grace window elapses.
    pub fn set_grace_period(&mut self, now: Instant) {
        let max_wait = scaled(self.base_time(), self.retries.saturating_add(2));
        let wait = self.jitter(max_wait);
        self.reset_deadline = Some(now + wait);
    }

    /// Force a reset on the next `arm` or `max_backoff_duration` call.
    pub const fn reset_now(&mut self, now: Instant) {
        self.reset_deadline = Some(now);
    }

    fn jitter(&mut self, max_wait: Duration) -> Duration {
        let nanos = u64::try_from(max_wait.as_nanos()).unwrap_or(u64::MAX);
        if nanos == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.rng.gen_range(0..nanos))
    }
}

/// `base * 2^exp`, saturating.
fn scaled(base: Duration, exp: u32) -> Duration {
    base.saturating_mul(2u32.checked_pow(exp).unwrap_or(u32::MAX))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const BASE: Duration = Duration::from_millis(100);

    fn handler(max_retries: u32, retry_forever: bool) -> BackoffHandler {
        BackoffHandler::new(max_retries, BASE, retry_forever).with_rng(StdRng::seed_from_u64(7))
    }

    #[test]
    fn zero_base_time_defaults_to_one_second() {
        let backoff = BackoffHandler::new(3, Duration::ZERO, false);
        assert_eq!(backoff.base_time(), Duration::from_secs(1));
    }

    #[test]
    fn waits_are_bounded_and_budget_runs_out() {
        let mut backoff = handler(3, false);
        let now = Instant::now();
        for n in 1..=3u32 {
            let wait = backoff.arm(now).unwrap();
            assert!(wait < BASE * 2u32.pow(n + 1), "retry {n} waited {wait:?}");
            assert_eq!(backoff.retries(), n);
        }
        assert!(backoff.reached_max_retries());
        assert_eq!(backoff.arm(now), None);
        assert_eq!(backoff.retries(), 3);
    }

    #[test]
    fn zero_max_retries_disables_retry() {
        let mut backoff = handler(0, false);
        assert_eq!(backoff.arm(Instant::now()), None);
        assert_eq!(
            backoff.max_backoff_duration(Instant::now(), &CancellationToken::new()),
            None
        );
    }

    #[test]
    fn retry_forever_caps_exponent() {
        let mut backoff = handler(2, true);
        let now = Instant::now();
        for _ in 0..10 {
            let wait = backoff.arm(now).unwrap();
            assert!(wait < BASE * 4);
        }
        assert_eq!(backoff.retries(), 2);
    }

    #[test]
    fn preview_does_not_consume_retries() {
        let mut backoff = handler(3, false);
        let cancel = CancellationToken::new();
        let now = Instant::now();
        assert_eq!(backoff.max_backoff_duration(now, &cancel), Some(BASE * 2));
        backoff.arm(now);
        assert_eq!(backoff.max_backoff_duration(now, &cancel), Some(BASE * 4));
        assert_eq!(backoff.retries(), 1);
    }

    #[test]
    fn preview_refuses_after_cancel() {
        let backoff = handler(3, true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(backoff.max_backoff_duration(Instant::now(), &cancel), None);
    }

    #[test]
    fn grace_period_resets_counter_after_deadline() {
        let mut backoff = handler(3, false);
        let now = Instant::now();
        backoff.arm(now);
        backoff.arm(now);
        backoff.arm(now);
        assert_eq!(backoff.arm(now), None);

        backoff.set_grace_period(now);
        let deadline = backoff.reset_deadline().unwrap();
        assert!(deadline < now + BASE * 2u32.pow(5));

        // Still inside the window: nothing changes
        if deadline > now {
            assert_eq!(backoff.arm(now), None);
        }

        let later = deadline + Duration::from_millis(1);
        let wait = backoff.arm(later).unwrap();
        assert_eq!(backoff.retries(), 1);
        assert!(wait < BASE * 2);
        assert_eq!(backoff.reset_deadline(), None);
    }

    #[test]
    fn reset_now_applies_on_next_arm() {
        let mut backoff = handler(1, false);
        let now = Instant::now();
        backoff.arm(now);
        assert!(backoff.reached_max_retries());
        backoff.reset_now(now);
        assert_eq!(
            backoff.max_backoff_duration(now, &CancellationToken::new()),
            Some(BASE * 2)
        );
        assert!(backoff.arm(now).is_some());
        assert_eq!(backoff.retries(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_sleeps_then_stops() {
        let mut backoff = handler(1, false);
        let cancel = CancellationToken::new();
        assert!(backoff.backoff(&cancel).await);
        assert!(!backoff.backoff(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_aborts_on_cancel() {
        let mut backoff = BackoffHandler::new(5, Duration::from_secs(3600), false);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!backoff.backoff(&cancel).await);
    }
}
