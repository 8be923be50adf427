//! Retry policy: decides whether a failed attempt is retried, and when.

use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{HushError, TransportFailure};

/// Backoff between attempts.
///
/// The delay before retry `n` (1-based) is `delay_ms * multiplier^(n-1)`.
/// When either quiver bound is set the delay `d` is jittered to
/// `d + d*start + random*d*(end-start)`, with `start` defaulting to 0 and
/// `end` to 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub delay_ms: u64,
    pub multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_quiver: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_quiver: Option<f64>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            multiplier: 1.0,
            start_quiver: None,
            end_quiver: None,
        }
    }
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay_ms: delay.as_millis() as u64,
            ..Self::default()
        }
    }

    /// Delay before the given retry.
    ///
    /// # Arguments
    /// * `retry` - Retry number, 1-indexed (the first retry is 1).
    ///
    /// Example with delay_ms=1000, multiplier=2.0:
    /// - retry 1: 1s
    /// - retry 2: 2s
    /// - retry 3: 4s
    pub fn next_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let mut delay = self.delay_ms as f64 * self.multiplier.powi(exponent);

        if self.start_quiver.is_some() || self.end_quiver.is_some() {
            let start = self.start_quiver.unwrap_or(0.0);
            let end = self.end_quiver.unwrap_or(1.0);
            delay += delay * start + rand::random::<f64>() * delay * (end - start);
            delay = delay.floor();
        }

        if delay.is_finite() && delay > 0.0 {
            Duration::from_millis(delay as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// Which transport failures are worth another attempt.
///
/// Patterns are regular expressions; an invalid pattern never matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryMatcher {
    #[default]
    Never,
    Always,
    /// Matches the failure message.
    Message { pattern: String },
    /// Matches the failure class name (`network`, `timeout`, `status`) and/or message.
    Failure {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

fn pattern_matches(pattern: &str, haystack: &str) -> bool {
    match Regex::new(pattern) {
        Ok(re) => re.is_match(haystack),
        Err(e) => {
            warn!(pattern, error = %e, "invalid retry pattern");
            false
        }
    }
}

impl RetryMatcher {
    pub fn message(pattern: impl Into<String>) -> Self {
        Self::Message {
            pattern: pattern.into(),
        }
    }

    pub fn matches(&self, failure: &TransportFailure) -> bool {
        match self {
            RetryMatcher::Never => false,
            RetryMatcher::Always => true,
            RetryMatcher::Message { pattern } => pattern_matches(pattern, &failure.message()),
            RetryMatcher::Failure { name, message } => {
                if name.is_none() && message.is_none() {
                    return false;
                }
                name.as_deref()
                    .is_none_or(|p| pattern_matches(p, failure.name()))
                    && message
                        .as_deref()
                        .is_none_or(|p| pattern_matches(p, &failure.message()))
            }
        }
    }
}

/// The next action after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Run the same task again after a delay.
    Retry { delay: Duration, reason: String },

    /// Give up: the task fails terminally.
    MarkFailed { reason: String },
}

/// Retry policy for one task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retry_times: u32,
    pub backoff: Backoff,
    pub retry_matcher: RetryMatcher,
}

impl RetryPolicy {
    /// Decide what happens after a failed attempt.
    ///
    /// # Arguments
    /// * `retry_times` - Retries already performed before this failure.
    /// * `error` - The failure. Only transport failures are ever retried.
    ///
    /// Pure: the caller applies the decision to the record.
    pub fn decide(&self, retry_times: u32, error: &HushError) -> Decision {
        let Some(failure) = error.as_transport() else {
            return Decision::MarkFailed {
                reason: format!("not retryable: {error}"),
            };
        };

        if retry_times >= self.max_retry_times {
            return Decision::MarkFailed {
                reason: format!(
                    "retry budget spent: {}/{}",
                    retry_times, self.max_retry_times
                ),
            };
        }

        if !self.retry_matcher.matches(failure) {
            return Decision::MarkFailed {
                reason: format!("failure does not match retry matcher: {failure}"),
            };
        }

        let delay = self.backoff.next_delay(retry_times + 1);
        Decision::Retry {
            delay,
            reason: format!(
                "retry {}/{} after {:?}",
                retry_times + 1,
                self.max_retry_times,
                delay
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_backoff_is_one_second_flat() {
        let b = Backoff::default();
        assert_eq!(b.next_delay(1), Duration::from_secs(1));
        assert_eq!(b.next_delay(5), Duration::from_secs(1));
    }

    #[test]
    fn exponential_backoff_increases() {
        let b = Backoff {
            delay_ms: 1000,
            multiplier: 2.0,
            ..Backoff::default()
        };
        assert_eq!(b.next_delay(1), Duration::from_secs(1));
        assert_eq!(b.next_delay(2), Duration::from_secs(2));
        assert_eq!(b.next_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn quiver_stays_within_bounds() {
        let b = Backoff {
            delay_ms: 1000,
            multiplier: 1.0,
            start_quiver: Some(0.5),
            end_quiver: Some(0.8),
        };
        for _ in 0..50 {
            let d = b.next_delay(1);
            assert!(d >= Duration::from_millis(1500), "{d:?}");
            assert!(d <= Duration::from_millis(1800), "{d:?}");
        }
    }

    #[rstest]
    #[case::never(RetryMatcher::Never, TransportFailure::network("reset"), false)]
    #[case::always(RetryMatcher::Always, TransportFailure::network("reset"), true)]
    #[case::message_hit(RetryMatcher::message("^server"), TransportFailure::status(500, "server error"), true)]
    #[case::message_miss(RetryMatcher::message("^server"), TransportFailure::status(400, "bad request"), false)]
    #[case::name_only(
        RetryMatcher::Failure { name: Some("timeout".into()), message: None },
        TransportFailure::Timeout { after_ms: 10 },
        true
    )]
    #[case::name_and_message(
        RetryMatcher::Failure { name: Some("status".into()), message: Some("5\\d\\d|server".into()) },
        TransportFailure::status(503, "bad request"),
        false
    )]
    #[case::empty_failure(
        RetryMatcher::Failure { name: None, message: None },
        TransportFailure::network("reset"),
        false
    )]
    #[case::invalid_pattern(RetryMatcher::message("("), TransportFailure::network("("), false)]
    fn matcher(#[case] m: RetryMatcher, #[case] failure: TransportFailure, #[case] expected: bool) {
        assert_eq!(m.matches(&failure), expected);
    }

    #[test]
    fn decide_respects_budget() {
        let policy = RetryPolicy {
            max_retry_times: 2,
            backoff: Backoff::fixed(Duration::from_millis(10)),
            retry_matcher: RetryMatcher::Always,
        };
        let err = HushError::from(TransportFailure::network("reset"));

        assert!(matches!(policy.decide(0, &err), Decision::Retry { .. }));
        assert!(matches!(policy.decide(1, &err), Decision::Retry { .. }));
        assert!(matches!(policy.decide(2, &err), Decision::MarkFailed { .. }));
    }

    #[test]
    fn non_transport_errors_never_retry() {
        let policy = RetryPolicy {
            max_retry_times: 5,
            retry_matcher: RetryMatcher::Always,
            ..RetryPolicy::default()
        };
        let err = HushError::Captured { tokens: vec![] };
        assert!(matches!(policy.decide(0, &err), Decision::MarkFailed { .. }));
    }

    #[test]
    fn matcher_json_is_tagged() {
        let m: RetryMatcher =
            serde_json::from_str(r#"{"kind":"message","pattern":"network"}"#).unwrap();
        assert_eq!(m, RetryMatcher::message("network"));
        let p: RetryPolicy = serde_json::from_str(r#"{"max_retry_times":3}"#).unwrap();
        assert_eq!(p.max_retry_times, 3);
        assert_eq!(p.retry_matcher, RetryMatcher::Never);
    }
}
