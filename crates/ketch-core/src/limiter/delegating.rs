use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::limiter::SpeedLimiter;

/// Two-level limiter (§4.4): holds a swappable inner limiter and, for the
/// per-task case, a parent limiter consulted first. One `globalLimiter`
/// is shared process-wide; each task gets its own `DelegatingSpeedLimiter`
/// wrapping that global one, so both budgets must clear before bytes flow.
pub struct DelegatingSpeedLimiter {
    parent: Option<Arc<dyn SpeedLimiter>>,
    inner: RwLock<Arc<dyn SpeedLimiter>>,
}

impl DelegatingSpeedLimiter {
    /// Process-wide limiter with no parent to consult.
    pub fn global(inner: Arc<dyn SpeedLimiter>) -> Self {
        Self { parent: None, inner: RwLock::new(inner) }
    }

    /// Per-task limiter delegating to `parent` (the global limiter) before
    /// enforcing its own budget.
    pub fn for_task(parent: Arc<dyn SpeedLimiter>, inner: Arc<dyn SpeedLimiter>) -> Self {
        Self { parent: Some(parent), inner: RwLock::new(inner) }
    }

    /// Replaces the inner limiter (§9 Design Notes, "Dynamic rate
    /// updates"): used when swapping between `Unlimited` and a
    /// `TokenBucket`, since `Unlimited::update_rate` can't express a rate
    /// change in place.
    pub async fn set_inner(&self, inner: Arc<dyn SpeedLimiter>) {
        *self.inner.write().await = inner;
    }

    /// Tries `update_rate` on the current inner limiter first; if it
    /// reports no rate concept (e.g. currently `Unlimited`), the caller
    /// should fall back to `set_inner` with a fresh `TokenBucket`.
    pub async fn try_update_rate(&self, bytes_per_second: u64) -> bool {
        self.inner.read().await.update_rate(bytes_per_second)
    }
}

#[async_trait]
impl SpeedLimiter for DelegatingSpeedLimiter {
    async fn acquire(&self, n: u64) {
        if let Some(parent) = &self.parent {
            parent.acquire(n).await;
        }
        let inner = self.inner.read().await.clone();
        inner.acquire(n).await;
    }

    fn update_rate(&self, _bytes_per_second: u64) -> bool {
        false
    }
}
