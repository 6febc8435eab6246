//! Full-jitter exponential backoff for transient backend failures.

use std::time::Duration;

use rand::Rng;

const DEFAULT_CAP: Duration = Duration::from_secs(60);

/// Exponential backoff with full jitter: each delay is drawn uniformly from
/// `[0, min(cap, base * 2^attempt)]`. Reset on the first success.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration) -> Self {
        Self::with_cap(base, DEFAULT_CAP)
    }

    pub fn with_cap(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next sleep duration; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        if ceiling.is_zero() {
            return Duration::ZERO;
        }
        let nanos = rand::thread_rng().gen_range(0..=ceiling.as_nanos() as u64);
        Duration::from_nanos(nanos)
    }

    fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_stay_under_the_growing_ceiling() {
        let mut backoff = Backoff::with_cap(Duration::from_millis(100), Duration::from_secs(60));
        for attempt in 0..10 {
            let ceiling = Duration::from_millis(100 * (1 << attempt));
            let delay = backoff.next_delay();
            assert!(delay <= ceiling.min(Duration::from_secs(60)), "attempt {attempt}");
        }
    }

    #[test]
    fn ceiling_caps_at_sixty_seconds() {
        let mut backoff = Backoff::new(Duration::from_secs(10));
        for _ in 0..20 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }

    #[test]
    fn reset_restarts_the_progression() {
        let mut backoff = Backoff::new(Duration::from_millis(50));
        for _ in 0..5 {
            backoff.next_delay();
        }
        assert_eq!(backoff.attempt(), 5);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(backoff.next_delay() <= Duration::from_millis(50));
    }

    #[test]
    fn zero_base_never_sleeps() {
        let mut backoff = Backoff::new(Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }
}
