// =============================================================================
// Retry Policy — exponential backoff schedule and error classification
// =============================================================================
//
// Modeled as pure functions so the schedule is unit-testable without I/O:
//   delay(attempt) = min(initial_ms * factor^attempt, max_ms)
// With the defaults (1000 ms, factor 2, cap 64 000 ms) the inter-attempt
// delays are the prefix of {1, 2, 4, 8, 16, 32, 64} seconds.
//
// Only the venue gateway retries. Higher layers never retry on top of the
// gateway, so a failure seen above this module is final.
// =============================================================================

use std::time::Duration;

use crate::config::RetryConfig;

/// Connection-level error names that are always retryable.
const RETRYABLE_CONNECTION_ERRORS: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ESOCKETTIMEDOUT",
    "ECONNREFUSED",
];

/// Message substrings that indicate a retryable gateway failure.
const RETRYABLE_MESSAGE_SUBSTRINGS: &[&str] = &["502", "504", "rate limit", "too many requests"];

/// Outcome of classifying a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Fail,
}

/// Immutable retry schedule derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_ms: u64,
    pub max_ms: u64,
    pub factor: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max,
            initial_ms: config.initial_ms,
            max_ms: config.max_ms,
            factor: config.factor,
        }
    }

    /// Delay before retry number `attempt` (0-based: the delay after the
    /// first failed attempt is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.initial_ms as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(raw.min(self.max_ms as f64) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Classify an HTTP response that was not a success.
///
/// 429 and 5xx are retryable; everything else in 4xx surfaces immediately
/// (auth, validation, insufficient funds). The body is scanned for gateway
/// substrings because some venues tunnel 502/504 text through a 200-shaped
/// error payload.
pub fn classify_response(status: u16, body: &str) -> RetryDecision {
    if status == 429 || status >= 500 {
        return RetryDecision::Retry;
    }
    let lower = body.to_lowercase();
    if RETRYABLE_MESSAGE_SUBSTRINGS.iter().any(|s| lower.contains(s)) {
        return RetryDecision::Retry;
    }
    RetryDecision::Fail
}

/// Classify a connection-level transport failure by error name.
pub fn classify_transport_error(message: &str) -> RetryDecision {
    if RETRYABLE_CONNECTION_ERRORS.iter().any(|e| message.contains(e)) {
        return RetryDecision::Retry;
    }
    let lower = message.to_lowercase();
    if lower.contains("timed out") || lower.contains("connection") {
        return RetryDecision::Retry;
    }
    RetryDecision::Fail
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_schedule_is_doubling_capped_at_64s() {
        let policy = RetryPolicy::default();
        let expected_secs = [1, 2, 4, 8, 16, 32, 64];
        for (attempt, secs) in expected_secs.iter().enumerate() {
            assert_eq!(
                policy.delay(attempt as u32),
                Duration::from_secs(*secs),
                "attempt {attempt}"
            );
        }
        // Beyond the cap the delay stays pinned.
        assert_eq!(policy.delay(7), Duration::from_secs(64));
        assert_eq!(policy.delay(20), Duration::from_secs(64));
    }

    #[test]
    fn default_policy_allows_seven_retries() {
        assert_eq!(RetryPolicy::default().max_retries, 7);
    }

    #[test]
    fn custom_schedule_respects_config() {
        let policy = RetryPolicy::from_config(&RetryConfig {
            max: 3,
            initial_ms: 100,
            max_ms: 350,
            factor: 2.0,
        });
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(350));
    }

    #[test]
    fn http_429_and_5xx_are_retryable() {
        assert_eq!(classify_response(429, "{}"), RetryDecision::Retry);
        assert_eq!(classify_response(500, "{}"), RetryDecision::Retry);
        assert_eq!(classify_response(503, "{}"), RetryDecision::Retry);
    }

    #[test]
    fn gateway_substrings_are_retryable() {
        assert_eq!(
            classify_response(400, r#"{"msg":"upstream 502 bad gateway"}"#),
            RetryDecision::Retry
        );
        assert_eq!(
            classify_response(418, r#"{"msg":"Too many requests"}"#),
            RetryDecision::Retry
        );
    }

    #[test]
    fn auth_and_validation_fail_immediately() {
        assert_eq!(
            classify_response(401, r#"{"msg":"invalid api key"}"#),
            RetryDecision::Fail
        );
        assert_eq!(
            classify_response(400, r#"{"msg":"insufficient funds"}"#),
            RetryDecision::Fail
        );
    }

    #[test]
    fn connection_error_names_are_retryable() {
        for name in ["ECONNRESET", "ETIMEDOUT", "ESOCKETTIMEDOUT", "ECONNREFUSED"] {
            assert_eq!(
                classify_transport_error(&format!("os error: {name}")),
                RetryDecision::Retry,
                "{name}"
            );
        }
        assert_eq!(classify_transport_error("tls handshake alert"), RetryDecision::Fail);
    }
}
