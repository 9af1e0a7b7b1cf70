//! Redial Backoff Policy
//!
//! Exponential backoff with jitter for redialing a lost stream. Delays grow
//! by a multiplier after every failed dial, are capped at a ceiling, and
//! return to the base interval after a successful connect.

use std::time::Duration;

use rand::Rng;

use crate::infrastructure::config::StreamConfig;

/// Configuration for redial behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first redial.
    pub initial_delay: Duration,
    /// Maximum delay between redials.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.15 = ±15% randomization).
    pub jitter_factor: f64,
    /// Maximum number of redial attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.15,
            max_attempts: 0, // Unlimited
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from [`StreamConfig`].
    #[must_use]
    pub const fn from_stream_config(config: &StreamConfig) -> Self {
        Self {
            initial_delay: config.initial_backoff,
            max_delay: config.max_backoff,
            multiplier: config.backoff_multiplier,
            jitter_factor: config.jitter_factor,
            max_attempts: config.max_retries,
        }
    }
}

/// Backoff state for one client.
///
/// # Example
///
/// ```rust
/// use stream_client::infrastructure::stream::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// let first = policy.next_delay();
/// assert!(first.is_some());
///
/// // Dial succeeded
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            attempt_count: 0,
        }
    }

    /// Get the delay before the next redial.
    ///
    /// Returns `None` once max attempts have been used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Return to the base interval after a successful connect.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.attempt_count = 0;
    }

    /// Redial attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

/// Error type for redial failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum redial attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn no_jitter(initial_ms: u64, max_ms: u64, multiplier: f64, max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[test]
    fn default_config_values() {
        let config = ReconnectConfig::default();
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!((config.jitter_factor - 0.15).abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 0);
    }

    #[test]
    fn from_stream_config() {
        let stream = StreamConfig::new("wss://x")
            .with_backoff(Duration::from_millis(250), Duration::from_secs(8))
            .with_max_retries(5);
        let config = ReconnectConfig::from_stream_config(&stream);
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(8));
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn policy_exponential_backoff() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 2.0, 0));

        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(200));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(400));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(800));
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = ReconnectPolicy::new(no_jitter(1000, 2000, 4.0, 0));

        let _ = policy.next_delay();
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(2000));
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(2000));
    }

    #[test]
    fn policy_max_attempts() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 1000, 2.0, 3));

        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert_eq!(policy.attempt_count(), 3);

        assert!(policy.next_delay().is_none());
        assert!(policy.next_delay().is_none());
    }

    #[test]
    fn policy_reset() {
        let mut policy = ReconnectPolicy::new(no_jitter(100, 10_000, 2.0, 3));

        let _ = policy.next_delay();
        let _ = policy.next_delay();
        assert_eq!(policy.attempt_count(), 2);

        policy.reset();

        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay().unwrap(), Duration::from_millis(100));
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = ReconnectPolicy::new(ReconnectConfig {
                initial_delay: Duration::from_millis(1000),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter_factor: 0.15,
                max_attempts: 0,
            });

            let millis = policy.next_delay().unwrap().as_millis();
            assert!(millis >= 850, "delay {millis}ms is below minimum 850ms");
            assert!(millis <= 1150, "delay {millis}ms is above maximum 1150ms");
        }
    }

    proptest! {
        #[test]
        fn delay_is_monotonic_up_to_ceiling(
            initial in 1u64..5_000,
            ceiling_extra in 0u64..60_000,
            multiplier in 1.0f64..4.0,
            steps in 1usize..40,
        ) {
            let max = initial + ceiling_extra;
            let mut policy = ReconnectPolicy::new(no_jitter(initial, max, multiplier, 0));
            let mut previous = Duration::ZERO;

            for _ in 0..steps {
                let delay = policy.next_delay().unwrap();
                prop_assert!(delay >= previous);
                prop_assert!(delay <= Duration::from_millis(max));
                previous = delay;
            }
        }
    }
}
