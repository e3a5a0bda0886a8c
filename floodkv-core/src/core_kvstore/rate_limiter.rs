/*
    rate_limiter.rs - token bucket limiting the area flood rate

    Flooding is bursty by nature: one merge can touch many keys and a
    busy neighbor can re-advertise its whole database. The limiter
    smooths this with a token bucket; publications that find the bucket
    empty are not dropped but parked in the pending-flood buffer and
    retried when tokens refill.
*/

use std::time::Instant;

/// Flood rate configuration: sustained messages per second plus burst size
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FloodRate {
    /// Token refill rate (publications per second)
    pub flood_msg_per_sec: f64,
    /// Bucket capacity (maximum burst)
    pub flood_msg_burst_size: f64,
}

/// Token bucket for outgoing floods of one area
#[derive(Debug)]
pub struct FloodLimiter {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl FloodLimiter {
    pub fn new(rate: FloodRate) -> Self {
        FloodLimiter {
            tokens: rate.flood_msg_burst_size,
            capacity: rate.flood_msg_burst_size,
            refill_rate: rate.flood_msg_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after refill)
    pub fn available(&mut self) -> f64 {
        self.refill(Instant::now());
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(rate: f64, burst: f64) -> FloodLimiter {
        FloodLimiter::new(FloodRate { flood_msg_per_sec: rate, flood_msg_burst_size: burst })
    }

    #[test]
    fn test_burst_then_exhaustion() {
        let now = Instant::now();
        let mut limiter = limiter(10.0, 3.0);
        assert!(limiter.try_acquire_at(now));
        assert!(limiter.try_acquire_at(now));
        assert!(limiter.try_acquire_at(now));
        assert!(!limiter.try_acquire_at(now));
    }

    #[test]
    fn test_refill_over_time() {
        let now = Instant::now();
        let mut limiter = limiter(10.0, 2.0);
        assert!(limiter.try_acquire_at(now));
        assert!(limiter.try_acquire_at(now));
        assert!(!limiter.try_acquire_at(now));

        // 10 tokens/sec: one token back after 100ms
        assert!(limiter.try_acquire_at(now + Duration::from_millis(100)));
        assert!(!limiter.try_acquire_at(now + Duration::from_millis(100)));
    }

    #[test]
    fn test_refill_capped_at_burst() {
        let now = Instant::now();
        let mut limiter = limiter(100.0, 2.0);
        assert!(limiter.try_acquire_at(now));

        // a long idle period refills to capacity, not beyond
        let later = now + Duration::from_secs(60);
        assert!(limiter.try_acquire_at(later));
        assert!(limiter.try_acquire_at(later));
        assert!(!limiter.try_acquire_at(later));
    }
}
