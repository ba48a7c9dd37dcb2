//! Two-level speed limiting (§4.4): a process-wide `TokenBucket` delegated
//! to by a per-task limiter, or `Unlimited` when no cap is configured.

mod delegating;
mod token_bucket;
mod unlimited;

pub use delegating::DelegatingSpeedLimiter;
pub use token_bucket::TokenBucket;
pub use unlimited::Unlimited;

use async_trait::async_trait;

/// Cooperative byte-rate throttle. `acquire` must be safe under many
/// concurrent callers; implementations serialize bucket mutation
/// internally.
#[async_trait]
pub trait SpeedLimiter: Send + Sync {
    /// Blocks until `n` bytes' worth of budget is available.
    async fn acquire(&self, n: u64);

    /// Changes the rate in place, if this limiter has one. Returns `false`
    /// for limiters with no concept of a rate (e.g. `Unlimited`), in which
    /// case the caller should swap the delegating limiter's inner pointer
    /// instead (§9 Design Notes, "Dynamic rate updates").
    fn update_rate(&self, _bytes_per_second: u64) -> bool {
        false
    }
}
