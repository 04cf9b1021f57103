//! Fixed-table retry policy for failed deliveries.
//!
//! The delay after a failed attempt depends only on that attempt's number:
//!
//! | failed attempt | next attempt in |
//! |---|---|
//! | 1 | 2s |
//! | 2 | 10s |
//! | 3 | 20s |
//! | 4 | 40s |
//! | 5 | 1m |
//! | 6+ | 5m |
//!
//! The tail stays flat at five minutes.

use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::Webhook;
use serde::{Deserialize, Serialize};

/// Delays for failed attempts 1 through 5.
const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(2),
    Duration::from_secs(10),
    Duration::from_secs(20),
    Duration::from_secs(40),
    Duration::from_secs(60),
];

/// Delay after the sixth and every later failed attempt.
pub const BACKOFF_TAIL: Duration = Duration::from_secs(300);

/// Returns the delay before the next attempt after `attempt_number` failed.
///
/// Attempt numbers are 1-indexed; zero and negative values are treated as
/// the first attempt.
pub fn backoff_for_attempt(attempt_number: i32) -> Duration {
    let index = usize::try_from(attempt_number.max(1) - 1).unwrap_or(0);
    BACKOFF_SCHEDULE.get(index).copied().unwrap_or(BACKOFF_TAIL)
}

/// Retry policy of one webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Whether failures are retried at all.
    pub retry_enabled: bool,
    /// Total attempts allowed, including the first.
    pub max_retries: i32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_enabled: true, max_retries: 5 }
    }
}

/// Result of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule another attempt.
    Retry {
        /// When the retry scheduler may pick the delivery up
        next_attempt_at: DateTime<Utc>,
    },
    /// Close the delivery as failed.
    GiveUp {
        /// Why no further attempt is made
        reason: String,
    },
}

impl RetryPolicy {
    /// Builds the policy for `webhook`, capping its attempt limit at
    /// `attempt_ceiling`.
    pub fn for_webhook(webhook: &Webhook, attempt_ceiling: i32) -> Self {
        Self {
            retry_enabled: webhook.retry_enabled,
            max_retries: webhook.max_retries.min(attempt_ceiling),
        }
    }

    /// Decides what happens after attempt `attempt_number` failed at
    /// `failed_at`.
    pub fn decide(&self, attempt_number: i32, failed_at: DateTime<Utc>) -> RetryDecision {
        if !self.retry_enabled {
            return RetryDecision::GiveUp { reason: "retries disabled".to_string() };
        }

        if attempt_number >= self.max_retries {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) reached", self.max_retries),
            };
        }

        let delay = backoff_for_attempt(attempt_number);
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp {
                reason: "retry delay duration out of range".to_string(),
            };
        };

        RetryDecision::Retry { next_attempt_at: failed_at + chrono_delay }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn failed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn backoff_table() {
        let expected = [(1, 2), (2, 10), (3, 20), (4, 40), (5, 60), (6, 300), (7, 300), (50, 300)];

        for (attempt, seconds) in expected {
            assert_eq!(
                backoff_for_attempt(attempt),
                Duration::from_secs(seconds),
                "attempt {attempt}"
            );
        }
    }

    #[test]
    fn out_of_range_attempts_use_first_delay() {
        assert_eq!(backoff_for_attempt(0), Duration::from_secs(2));
        assert_eq!(backoff_for_attempt(-3), Duration::from_secs(2));
    }

    #[test]
    fn retries_while_below_limit() {
        let policy = RetryPolicy { retry_enabled: true, max_retries: 3 };

        match policy.decide(2, failed_at()) {
            RetryDecision::Retry { next_attempt_at } => {
                assert_eq!(next_attempt_at, failed_at() + chrono::Duration::seconds(10));
            },
            RetryDecision::GiveUp { .. } => unreachable!("attempt 2 of 3 should retry"),
        }
    }

    #[test]
    fn gives_up_at_limit() {
        let policy = RetryPolicy { retry_enabled: true, max_retries: 2 };

        match policy.decide(2, failed_at()) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts (2)")),
            RetryDecision::Retry { .. } => unreachable!("attempt 2 of 2 is terminal"),
        }
    }

    #[test]
    fn disabled_policy_gives_up_after_first_failure() {
        let policy = RetryPolicy { retry_enabled: false, max_retries: 10 };

        assert_eq!(
            policy.decide(1, failed_at()),
            RetryDecision::GiveUp { reason: "retries disabled".to_string() }
        );
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let policy = RetryPolicy { retry_enabled: true, max_retries: 0 };

        assert!(matches!(policy.decide(1, failed_at()), RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn webhook_limit_is_capped() {
        let mut webhook = Webhook::new(
            courier_core::AccountId::new(),
            "https://example.com",
            vec!["user.created".to_string()],
        );
        webhook.max_retries = 1_000;

        let policy = RetryPolicy::for_webhook(&webhook, 25);

        assert_eq!(policy.max_retries, 25);
        assert!(policy.retry_enabled);
    }
}
