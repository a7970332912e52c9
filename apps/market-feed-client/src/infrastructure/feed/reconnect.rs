//! Reconnection Policy
//!
//! Bounded linear backoff for WebSocket reconnection: the n-th consecutive
//! attempt waits `n × base_delay`. Once `max_attempts` attempts have been
//! scheduled the policy refuses further attempts until it is reset.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay unit; attempt `n` waits `n` of these.
    pub base_delay: Duration,
    /// Maximum number of consecutive reconnection attempts.
    pub max_attempts: u32,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(base_delay: Duration, max_attempts: u32, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_attempts,
            jitter_factor,
        }
    }

    /// Create configuration from `FeedSettings`.
    #[must_use]
    pub const fn from_feed_settings(settings: &crate::FeedSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base_delay,
            max_attempts: settings.max_reconnect_attempts,
            jitter_factor: settings.reconnect_jitter,
        }
    }
}

/// Reconnection policy implementing bounded linear backoff.
///
/// # Example
///
/// ```rust
/// use market_feed_client::infrastructure::feed::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::new(Duration::from_secs(1), 3, 0.0));
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(3)));
/// assert_eq!(policy.next_delay(), None);
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Schedule the next attempt and return how long to wait before it.
    ///
    /// Returns `None` once `max_attempts` attempts have been scheduled.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        self.attempt_count += 1;

        let delay = self
            .config
            .base_delay
            .checked_mul(self.attempt_count)
            .unwrap_or(Duration::MAX);

        Some(self.apply_jitter(delay))
    }

    /// Reset the policy after a successful connection or an explicit disconnect.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt may be scheduled.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.attempt_count < self.config.max_attempts
    }

    /// Maximum number of consecutive attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn policy(base_ms: u64, max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(ReconnectConfig::new(
            Duration::from_millis(base_ms),
            max_attempts,
            0.0,
        ))
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.base_delay, Duration::from_secs(1));
        assert_eq!(config.max_attempts, 5);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
    }

    #[test_case(1, 1000 ; "first attempt waits one base delay")]
    #[test_case(2, 2000 ; "second attempt waits two base delays")]
    #[test_case(3, 3000 ; "third attempt waits three base delays")]
    fn policy_linear_backoff(attempt: u32, expected_ms: u64) {
        let mut policy = policy(1000, 3);

        let mut delay = None;
        for _ in 0..attempt {
            delay = policy.next_delay();
        }

        assert_eq!(delay, Some(Duration::from_millis(expected_ms)));
        assert_eq!(policy.attempt_count(), attempt);
    }

    #[test]
    fn policy_stops_after_max_attempts() {
        let mut policy = policy(1000, 3);

        assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(3000)));

        // Fourth close schedules nothing
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
        assert_eq!(policy.attempt_count(), 3);

        // And stays terminal
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn policy_reset() {
        let mut policy = policy(100, 3);

        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert!(policy.should_retry());
        assert_eq!(policy.next_delay(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn zero_max_attempts_never_retries() {
        let mut policy = policy(100, 0);
        assert!(!policy.should_retry());
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut jittered = ReconnectPolicy::new(ReconnectConfig::new(
                Duration::from_millis(1000),
                5,
                0.1,
            ));

            let millis = jittered.next_delay().unwrap().as_millis();

            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }
}
