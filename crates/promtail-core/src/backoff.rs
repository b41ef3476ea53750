// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use crate::constants;

/// Exponential back-off between push attempts.
///
/// The delay after `n` failed attempts is `min * 2^(n - 1)`, never longer
/// than `max`. `max_retries` is the total attempt ceiling, the first attempt
/// included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub min: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff {
            min: constants::DEFAULT_BACKOFF_MIN,
            max: constants::DEFAULT_BACKOFF_MAX,
            max_retries: constants::DEFAULT_MAX_RETRIES,
        }
    }
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(min: Duration, max: Duration, max_retries: u32) -> Self {
        ExponentialBackoff {
            min,
            max,
            max_retries,
        }
    }

    /// Attempt ceiling. Always at least one so a push is never skipped.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Delay to wait after `failed` attempts have failed.
    #[must_use]
    pub fn delay(&self, failed: u32) -> Duration {
        let factor = 2u32.checked_pow(failed.saturating_sub(1)).unwrap_or(u32::MAX);
        self.min
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_doubles() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(30),
            10,
        );
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_stops_at_max() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(2), Duration::from_millis(4), 5);
        assert_eq!(backoff.delay(1), Duration::from_millis(2));
        assert_eq!(backoff.delay(2), Duration::from_millis(4));
        assert_eq!(backoff.delay(3), Duration::from_millis(4));
    }

    #[test]
    fn test_delay_saturates() {
        let backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(backoff.delay(64), Duration::from_secs(30));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_max_when_max_less_than_min() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(20), Duration::from_millis(10), 3);
        assert_eq!(backoff.delay(1), Duration::from_millis(10));
    }

    #[test]
    fn test_attempts_at_least_one() {
        let backoff = ExponentialBackoff {
            max_retries: 0,
            ..ExponentialBackoff::default()
        };
        assert_eq!(backoff.attempts(), 1);
    }
}
