/*
    backoff.rs - exponential backoff schedule for peer retries

    Each peer keeps an independent schedule. Errors double the wait up
    to a ceiling; a success resets it. The schedule answers "may I try
    now" and "how long until I may", which the area loop polls on its
    sync scan timer.
*/

use std::time::{Duration, Instant};

/// Exponential backoff with a fixed doubling factor
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    last_error: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        ExponentialBackoff { initial, max, current: initial, last_error: None }
    }

    /// Record a failed attempt; the next wait doubles, capped at max
    pub fn report_error(&mut self) {
        self.report_error_at(Instant::now());
    }

    pub fn report_error_at(&mut self, now: Instant) {
        if self.last_error.is_some() {
            self.current = (self.current * 2).min(self.max);
        } else {
            self.current = self.initial;
        }
        self.last_error = Some(now);
    }

    /// Record a successful attempt; the schedule resets
    pub fn report_success(&mut self) {
        self.current = self.initial;
        self.last_error = None;
    }

    /// Whether a retry is allowed now
    pub fn can_try_now(&self) -> bool {
        self.time_until_retry(Instant::now()).is_zero()
    }

    /// Remaining wait before the next attempt is allowed
    pub fn time_until_retry(&self, now: Instant) -> Duration {
        match self.last_error {
            None => Duration::ZERO,
            Some(at) => (at + self.current).saturating_duration_since(now),
        }
    }

    /// Whether the schedule has hit its ceiling
    pub fn at_max(&self) -> bool {
        self.current >= self.max
    }

    /// The wait currently in force
    pub fn current_backoff(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_schedule_allows_retry() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(64), Duration::from_millis(8192));
        assert!(backoff.can_try_now());
        assert_eq!(backoff.time_until_retry(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn test_geometric_schedule_capped() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(64), Duration::from_millis(8192));
        let now = Instant::now();

        let mut waits = Vec::new();
        for _ in 0..10 {
            backoff.report_error_at(now);
            waits.push(backoff.current_backoff().as_millis() as u64);
        }
        assert_eq!(waits, vec![64, 128, 256, 512, 1024, 2048, 4096, 8192, 8192, 8192]);
        assert!(backoff.at_max());
    }

    #[test]
    fn test_wait_decays_with_time() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(800));
        let now = Instant::now();
        backoff.report_error_at(now);

        assert_eq!(backoff.time_until_retry(now), Duration::from_millis(100));
        assert_eq!(backoff.time_until_retry(now + Duration::from_millis(40)), Duration::from_millis(60));
        assert_eq!(backoff.time_until_retry(now + Duration::from_millis(100)), Duration::ZERO);
    }

    #[test]
    fn test_success_resets() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_millis(64), Duration::from_millis(8192));
        let now = Instant::now();
        for _ in 0..5 {
            backoff.report_error_at(now);
        }
        assert!(backoff.current_backoff() > Duration::from_millis(64));

        backoff.report_success();
        assert!(backoff.can_try_now());
        assert_eq!(backoff.current_backoff(), Duration::from_millis(64));
    }
}
