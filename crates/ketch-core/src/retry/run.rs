use std::future::Future;

use crate::error::KetchError;
use crate::retry::classify::classify;
use crate::retry::policy::{RetryDecision, RetryPolicy};

/// Runs an async closure until it succeeds or the policy says to stop,
/// sleeping for the backoff duration between attempts.
pub async fn run_with_retry<F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<(), KetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), KetchError>>,
{
    let mut attempt = 1u32;
    loop {
        match attempt_fn().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                let kind = classify(&err);
                let retry_after = match &err {
                    KetchError::Http { retry_after, .. } => *retry_after,
                    _ => None,
                };
                match policy.decide(attempt, kind, retry_after) {
                    RetryDecision::NoRetry => return Err(err),
                    RetryDecision::RetryAfter(delay) => {
                        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}
