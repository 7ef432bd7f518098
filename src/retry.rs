//! Retry policy for opening change requests.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff for transient failures when opening a feed.
///
/// Applies only to establishing a changes request, which is an idempotent
/// GET. Once a continuous response is streaming, a dropped connection ends
/// the session; it is never silently reopened.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: JitterMode,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            max_retries: 3,
            jitter: JitterMode::Full,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::default().with_max_retries(0)
    }

    pub fn with_initial_backoff(mut self, delay: Duration) -> Self {
        self.initial_backoff = delay;
        self
    }

    pub fn with_max_backoff(mut self, delay: Duration) -> Self {
        self.max_backoff = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_jitter(mut self, jitter: JitterMode) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff before retry number `attempt` (zero-based), without jitter.
    ///
    /// Grows by `multiplier` per attempt and never exceeds `max_backoff`.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let secs = self.initial_backoff.as_secs_f64() * factor;
        if secs >= self.max_backoff.as_secs_f64() {
            self.max_backoff
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Backoff before retry number `attempt`, with jitter applied.
    pub fn next_backoff(&self, attempt: u32) -> Duration {
        self.jitter.apply(self.base_backoff(attempt))
    }

    /// Delay before retry number `attempt` when the server asked for
    /// `retry_after`. The server's delay is honored up to `max_backoff`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(requested) => requested.min(self.max_backoff),
            None => self.next_backoff(attempt),
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// How much randomness to mix into each backoff delay.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum JitterMode {
    /// Use the backoff delay exactly
    None,
    /// Anywhere between zero and the backoff delay
    #[default]
    Full,
    /// Half the backoff delay, plus up to half again at random
    Equal,
}

impl JitterMode {
    pub fn apply(self, delay: Duration) -> Duration {
        let secs = delay.as_secs_f64();
        match self {
            JitterMode::None => delay,
            JitterMode::Full => Duration::from_secs_f64(rand::thread_rng().gen::<f64>() * secs),
            JitterMode::Equal => {
                let half = secs / 2.0;
                Duration::from_secs_f64(half + rand::thread_rng().gen::<f64>() * half)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::new()
            .with_initial_backoff(Duration::from_millis(100))
            .with_max_backoff(Duration::from_millis(350))
            .with_multiplier(2.0)
            .with_jitter(JitterMode::None);

        assert_eq!(config.next_backoff(0), Duration::from_millis(100));
        assert_eq!(config.next_backoff(1), Duration::from_millis(200));
        assert_eq!(config.next_backoff(2), Duration::from_millis(350));
        assert_eq!(config.next_backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(200);
        for _ in 0..100 {
            assert!(JitterMode::Full.apply(delay) <= delay);
            let equal = JitterMode::Equal.apply(delay);
            assert!(equal >= delay / 2 && equal <= delay);
        }
        assert_eq!(JitterMode::None.apply(delay), delay);
    }

    #[test]
    fn test_server_requested_delay_is_capped() {
        let config = RetryConfig::new()
            .with_max_backoff(Duration::from_secs(5))
            .with_jitter(JitterMode::None);

        assert_eq!(config.delay_for(0, Some(Duration::from_secs(2))), Duration::from_secs(2));
        assert_eq!(config.delay_for(0, Some(Duration::from_secs(120))), Duration::from_secs(5));
        assert_eq!(config.delay_for(1, None), config.base_backoff(1));
    }

    #[test]
    fn test_attempt_limit() {
        let config = RetryConfig::new().with_max_retries(2);
        assert!(config.should_retry(0));
        assert!(config.should_retry(1));
        assert!(!config.should_retry(2));
        assert!(!RetryConfig::none().should_retry(0));
    }
}
