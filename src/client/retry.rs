//! Exponential backoff for retried responses.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// Upper bound on a single delay unless configured otherwise.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Computes the delay before each retry.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    initial_backoff: Duration,
    max_backoff: Duration,
    factor: f64,
    max_attempts: u32,
    jitter: bool,
}

impl BackoffPolicy {
    /// Create a policy whose delays never exceed [`DEFAULT_MAX_BACKOFF`].
    pub fn new(initial_backoff: Duration, factor: f64, max_attempts: u32, jitter: bool) -> Self {
        Self {
            initial_backoff,
            max_backoff: DEFAULT_MAX_BACKOFF,
            factor,
            max_attempts,
            jitter,
        }
    }

    /// Cap every delay at `max_backoff`.
    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = max_backoff;
        self
    }

    /// Total attempts allowed, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), or `None`
    /// when no attempts remain.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        if self.initial_backoff.is_zero() {
            return Some(Duration::ZERO);
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = (self.initial_backoff.as_secs_f64() * self.factor.powi(exponent))
            .min(self.max_backoff.as_secs_f64());
        let delay = if self.jitter {
            base * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            base
        };
        Some(
            Duration::try_from_secs_f64(delay)
                .map_or(self.max_backoff, |delay| delay.min(self.max_backoff)),
        )
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            config.backoff_factor,
            config.max_attempts,
            config.jitter,
        )
        .with_max_backoff(Duration::from_millis(config.max_backoff_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delays() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), 2.0, 4, false);

        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(400)));
        assert_eq!(policy.delay_for(4), None);
    }

    #[test]
    fn test_single_attempt_never_retries() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 2.0, 1, false);
        assert_eq!(policy.delay_for(1), None);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), 1.0, 10, true);
        for attempt in 1..10 {
            let delay = policy.delay_for(attempt).unwrap();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn test_from_config() {
        let config = BackoffConfig {
            max_attempts: 2,
            initial_backoff_ms: 250,
            backoff_factor: 3.0,
            max_backoff_ms: 60_000,
            jitter: false,
        };
        let policy = BackoffPolicy::from(&config);

        assert_eq!(policy.max_attempts(), 2);
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(250)));
        assert_eq!(policy.delay_for(2), None);
    }

    #[test]
    fn test_long_retry_sequences_are_capped() {
        let policy = BackoffPolicy::new(Duration::from_millis(500), 2.0, 2000, false);

        assert_eq!(policy.delay_for(1100), Some(DEFAULT_MAX_BACKOFF));
        assert_eq!(policy.delay_for(1999), Some(DEFAULT_MAX_BACKOFF));

        let capped = policy.with_max_backoff(Duration::from_secs(2));
        assert_eq!(capped.delay_for(2), Some(Duration::from_secs(1)));
        assert_eq!(capped.delay_for(10), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_jittered_cap_stays_within_bounds() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), 10.0, u32::MAX, true)
            .with_max_backoff(Duration::from_secs(5));
        let delay = policy.delay_for(u32::MAX - 1).unwrap();
        assert!(delay >= Duration::from_millis(2500));
        assert!(delay <= Duration::from_secs(5));
    }
}
