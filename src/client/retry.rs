use crate::config::RetryConfig;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::time::Duration;

/// Retry budget and delays shared by every brokerage call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    /// Per-attempt timeout
    pub request_timeout: Duration,
    /// Wait applied to a 429 without a usable `Retry-After`
    pub default_retry_after: Duration,
    /// Sequences running longer than this re-validate the token before the final attempt
    pub revalidate_after: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            default_retry_after: Duration::from_secs(config.default_retry_after_seconds),
            revalidate_after: Duration::from_secs(config.revalidate_after_seconds),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Server-dictated wait for a 429 response.
    ///
    /// `Retry-After` is read as whole seconds; anything else falls back to
    /// the default.
    pub fn retry_after_delay(&self, headers: &HeaderMap) -> Duration {
        headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(self.default_retry_after)
    }
}
