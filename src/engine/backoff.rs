//! Bounded retry schedule: doubling delay from a base, capped, with jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay added or removed at random, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based), before jitter.
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
        }
    }
}

/// Retry state for one logical request.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
}

impl Backoff {
    /// Next delay to wait, or `None` once the budget is spent.
    pub fn next_delay<R: Rng>(&mut self, rng: &mut R) -> Option<Duration> {
        if self.retries >= self.policy.max_retries {
            return None;
        }
        let nominal = self.policy.nominal_delay(self.retries);
        self.retries += 1;
        Some(apply_jitter(nominal, self.policy.jitter, rng))
    }

    /// Consume one retry without a delay (the caller waits some other way).
    pub fn spend(&mut self) -> bool {
        if self.retries >= self.policy.max_retries {
            return false;
        }
        self.retries += 1;
        true
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Attempts made so far, counting the first one.
    pub fn attempts(&self) -> u32 {
        self.retries + 1
    }

    pub fn reset(&mut self) {
        self.retries = 0;
    }
}

fn apply_jitter<R: Rng>(delay: Duration, jitter: f64, rng: &mut R) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 {
        return delay;
    }
    let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
    delay.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter,
        }
    }

    #[test]
    fn delays_double_then_cap() {
        let p = policy(0.0);
        assert_eq!(p.nominal_delay(0), Duration::from_millis(100));
        assert_eq!(p.nominal_delay(1), Duration::from_millis(200));
        assert_eq!(p.nominal_delay(2), Duration::from_millis(400));
        assert_eq!(p.nominal_delay(3), Duration::from_millis(500));
        assert_eq!(p.nominal_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn budget_is_bounded() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut backoff = policy(0.0).start();
        let delays: Vec<_> = std::iter::from_fn(|| backoff.next_delay(&mut rng)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
            ]
        );
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.next_delay(&mut rng).is_none());
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let p = policy(0.25);
        for _ in 0..200 {
            let mut backoff = p.start();
            let delay = backoff.next_delay(&mut rng).unwrap();
            assert!(delay >= Duration::from_millis(74), "{:?}", delay);
            assert!(delay <= Duration::from_millis(126), "{:?}", delay);
        }
    }

    #[test]
    fn spend_and_reset() {
        let mut backoff = RetryPolicy {
            max_retries: 1,
            ..policy(0.0)
        }
        .start();
        assert!(backoff.spend());
        assert!(!backoff.spend());
        backoff.reset();
        assert_eq!(backoff.retries(), 0);
        assert!(backoff.spend());
    }

    #[test]
    fn zero_retries_never_waits() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut backoff = RetryPolicy {
            max_retries: 0,
            ..policy(0.0)
        }
        .start();
        assert!(backoff.next_delay(&mut rng).is_none());
    }
}
