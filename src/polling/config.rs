//! Polling configuration.

use std::time::Duration;

/// Retry budget and timing of a [`PollingEngine`](super::PollingEngine).
///
/// # Examples
///
/// ```rust
/// use deferral::polling::{Backoff, PollingConfig};
/// use std::time::Duration;
///
/// let config = PollingConfig::default()
///     .with_retry_count(5)
///     .with_idle_interval(Duration::from_millis(200))
///     .with_minimum_waiting_time(Duration::from_secs(3))
///     .with_backoff(Backoff::new(2.0, Duration::from_secs(2)));
///
/// assert_eq!(config.delay_for(0), Duration::from_millis(200));
/// assert_eq!(config.delay_for(2), Duration::from_millis(800));
/// assert_eq!(config.delay_for(10), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PollingConfig {
    /// Re-attempts allowed after the first attempt. Values below 1 are raised
    /// to 1 when the engine is built.
    pub retry_count: u32,
    /// Delay between an attempt's result and the next attempt.
    pub idle_interval: Duration,
    /// Keep re-attempting until this much time has passed since the first
    /// attempt, even with the retry budget spent.
    pub minimum_waiting_time: Option<Duration>,
    /// Grow the delay between attempts; constant `idle_interval` when absent.
    pub backoff: Option<Backoff>,
}

/// Exponential growth of the inter-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Backoff {
    /// Multiplier applied per re-attempt.
    pub factor: f64,
    /// Upper bound of any single delay.
    pub max: Duration,
}

impl Backoff {
    /// Creates a backoff policy.
    #[must_use]
    pub const fn new(factor: f64, max: Duration) -> Self {
        Self { factor, max }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            retry_count: 1,
            idle_interval: Duration::from_secs(1),
            minimum_waiting_time: None,
            backoff: None,
        }
    }
}

impl PollingConfig {
    /// Sets the retry budget.
    #[must_use]
    pub const fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Sets the delay between attempts.
    #[must_use]
    pub const fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
        self.idle_interval = idle_interval;
        self
    }

    /// Sets the minimum total polling time.
    #[must_use]
    pub const fn with_minimum_waiting_time(mut self, minimum_waiting_time: Duration) -> Self {
        self.minimum_waiting_time = Some(minimum_waiting_time);
        self
    }

    /// Sets the backoff policy.
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    /// Delay before re-attempt number `retry` (0-based).
    ///
    /// `idle_interval * factor^retry`, clamped to `backoff.max`.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let Some(backoff) = self.backoff else {
            return self.idle_interval;
        };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let seconds = self.idle_interval.as_secs_f64() * backoff.factor.powi(exponent);
        if !seconds.is_finite() || seconds >= backoff.max.as_secs_f64() {
            backoff.max
        } else if seconds <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(seconds)
        }
    }

    /// The retry budget with the lower bound applied.
    pub(crate) fn effective_retry_count(&self) -> u32 {
        if self.retry_count == 0 {
            tracing::warn!("polling configured with zero retries; using 1");
            1
        } else {
            self.retry_count
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn test_default_matches_documented_values() {
        let config = PollingConfig::default();
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.idle_interval, Duration::from_secs(1));
        assert_eq!(config.minimum_waiting_time, None);
        assert_eq!(config.backoff, None);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(7, 7)]
    fn test_retry_count_is_clamped(#[case] configured: u32, #[case] effective: u32) {
        let config = PollingConfig::default().with_retry_count(configured);
        assert_eq!(config.effective_retry_count(), effective);
    }

    #[rstest]
    #[case(0, Duration::from_millis(100))]
    #[case(1, Duration::from_millis(300))]
    #[case(2, Duration::from_millis(900))]
    #[case(3, Duration::from_secs(1))]
    fn test_backoff_grows_and_clamps(#[case] retry: u32, #[case] expected: Duration) {
        let config = PollingConfig::default()
            .with_idle_interval(Duration::from_millis(100))
            .with_backoff(Backoff::new(3.0, Duration::from_secs(1)));

        let delay = config.delay_for(retry);
        let difference = delay.abs_diff(expected);
        assert!(difference < Duration::from_micros(1), "{delay:?} != {expected:?}");
    }

    #[rstest]
    fn test_constant_delay_without_backoff() {
        let config = PollingConfig::default().with_idle_interval(Duration::from_millis(250));
        assert_eq!(config.delay_for(0), config.delay_for(40));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_max(
            retry in 0_u32..10_000,
            factor in 0.0_f64..16.0,
            idle_ms in 0_u64..60_000,
        ) {
            let max = Duration::from_secs(30);
            let config = PollingConfig::default()
                .with_idle_interval(Duration::from_millis(idle_ms))
                .with_backoff(Backoff::new(factor, max));

            prop_assert!(config.delay_for(retry) <= max);
        }
    }
}
