use std::time::Duration;

/// High-level classification of a `KetchError` for retry purposes (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport-level failure before or during byte transfer.
    Network,
    /// `429 Too Many Requests`.
    Throttled,
    /// `5xx` response.
    Http5xx(u16),
    /// Anything terminal: not retried regardless of attempt count.
    Terminal,
}

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with a 60 s cap (§4.5 step 6).
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per segment, including the first (`retryCount`).
    pub max_attempts: u32,
    /// `retryDelayMs`.
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(retry_count: u32, retry_delay_ms: u64) -> Self {
        Self {
            max_attempts: retry_count,
            base_delay: Duration::from_millis(retry_delay_ms),
            max_delay: Duration::from_secs(60),
        }
    }

    /// `attempt` is 1-based. `retry_after` is an explicit server hint
    /// (`Retry-After` / RateLimit headers on a 429) that overrides the
    /// computed backoff when present, per §4.5 step 6.
    pub fn decide(
        &self,
        attempt: u32,
        kind: ErrorKind,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if kind == ErrorKind::Terminal {
            return RetryDecision::NoRetry;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        if let Some(hint) = retry_after {
            return RetryDecision::RetryAfter(hint.min(self.max_delay));
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(delay)
    }
}
