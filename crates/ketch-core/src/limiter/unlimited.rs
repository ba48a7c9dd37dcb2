use async_trait::async_trait;

use crate::limiter::SpeedLimiter;

/// No-op limiter: `acquire` returns immediately (§4.4).
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait]
impl SpeedLimiter for Unlimited {
    async fn acquire(&self, _n: u64) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_never_blocks() {
        let limiter = Unlimited;
        limiter.acquire(u64::MAX).await;
    }
}
