use rand::Rng;
use std::time::Duration;

/// Explicit retry policy applied at each call site that needs one.
///
/// Delay for attempt `n` (0-based) is `initial_delay * backoff_factor^n`,
/// with optional ±25% jitter to avoid thundering herd.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, initial_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            initial_delay,
            backoff_factor,
            jitter: true,
        }
    }

    /// Delay to sleep before retrying after failed attempt `attempt`.
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let ms = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.75..=1.25);
            base * factor
        } else {
            base
        };
        Duration::from_millis(ms as u64)
    }
}

/// Uniform random delay in `[min, max]`, used where the original protocol
/// calls for a flat randomized wait rather than exponential growth.
pub fn uniform_delay(min: Duration, max: Duration) -> Duration {
    let ms = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
    Duration::from_millis(ms as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_grow_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
    }

    #[test]
    fn test_jitter_stays_within_band() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1000), 2.0);
        for _ in 0..50 {
            let d = policy.delay_for(1).as_millis();
            assert!((1500..=2500).contains(&d), "delay {} outside jitter band", d);
        }
    }

    #[test]
    fn test_uniform_delay_bounds() {
        for _ in 0..50 {
            let d = uniform_delay(Duration::from_secs(5), Duration::from_secs(10));
            assert!(d >= Duration::from_secs(5) && d <= Duration::from_secs(10));
        }
    }
}
