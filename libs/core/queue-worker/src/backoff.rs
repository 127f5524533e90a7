//! Exponential backoff with additive jitter.
//!
//! `delay(n) = base * 2^n + U[0, ratio * base * 2^n)`, floored to whole milliseconds.

use std::time::Duration;

/// Jitter added on top of the exponential delay, as a fraction of it
pub const DEFAULT_JITTER_RATIO: f64 = 0.3;

// Largest sample strictly below 1.0, keeps the upper bound exclusive.
const MAX_SAMPLE: f64 = 1.0 - f64::EPSILON;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base_delay_ms: u64,
    jitter_ratio: f64,
}

impl Backoff {
    pub fn new(base_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    /// Deterministic part of the delay, saturating at `u64::MAX`
    pub fn exponential_ms(&self, retry_count: u32) -> u64 {
        2u64.checked_pow(retry_count)
            .map_or(u64::MAX, |factor| self.base_delay_ms.saturating_mul(factor))
    }

    /// Delay for `retry_count` using a caller-supplied sample in `[0, 1)`.
    pub fn delay_with_sample(&self, retry_count: u32, sample: f64) -> Duration {
        let exponential = self.exponential_ms(retry_count);
        let sample = if sample.is_finite() {
            sample.clamp(0.0, MAX_SAMPLE)
        } else {
            0.0
        };
        let jitter = (exponential as f64 * self.jitter_ratio * sample).floor() as u64;
        Duration::from_millis(exponential.saturating_add(jitter))
    }

    /// Delay for `retry_count` with a freshly drawn jitter sample.
    ///
    /// `retry_count` is the attempt about to be scheduled, so the first retry passes 1.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        self.delay_with_sample(retry_count, rand::random::<f64>())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let backoff = Backoff::new(1000);
        assert_eq!(backoff.exponential_ms(0), 1000);
        assert_eq!(backoff.exponential_ms(1), 2000);
        assert_eq!(backoff.exponential_ms(2), 4000);
        assert_eq!(backoff.exponential_ms(3), 8000);
    }

    #[test]
    fn test_sample_bounds() {
        let backoff = Backoff::new(1000);
        assert_eq!(backoff.delay_with_sample(1, 0.0), Duration::from_millis(2000));
        assert_eq!(backoff.delay_with_sample(1, 0.5), Duration::from_millis(2300));
        assert!(backoff.delay_with_sample(1, 1.0) < Duration::from_millis(2600));
        assert_eq!(backoff.delay_with_sample(1, f64::NAN), Duration::from_millis(2000));
    }

    #[test]
    fn test_random_delay_stays_in_window() {
        let base = 250;
        let backoff = Backoff::new(base);
        let max_retries = 5;

        for n in 0..=max_retries {
            let next = n + 1;
            let low = base * 2u64.pow(next);
            let high = low as f64 * 1.3;
            for _ in 0..200 {
                let delay = backoff.delay_for(next).as_millis() as u64;
                assert!(delay >= low, "delay {delay} below {low} for retry {next}");
                assert!((delay as f64) < high, "delay {delay} above {high} for retry {next}");
            }
        }
    }

    #[test]
    fn test_saturates_instead_of_overflowing() {
        let backoff = Backoff::new(u64::MAX / 2);
        assert_eq!(backoff.exponential_ms(80), u64::MAX);
        assert_eq!(backoff.delay_with_sample(80, 0.9), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_zero_jitter_ratio_is_deterministic() {
        let backoff = Backoff::new(100).with_jitter_ratio(0.0);
        assert_eq!(backoff.delay_for(3), Duration::from_millis(800));
    }
}
