use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::limiter::SpeedLimiter;

/// Default burst size (§4.4): 64 KiB.
pub const DEFAULT_BURST_BYTES: u64 = 64 * 1024;

struct BucketState {
    credits: u64,
    last_refill: Instant,
}

/// Rate-limited byte budget: refills at `rate` bytes/second up to
/// `burst_size`, deducted atomically on `acquire`. Refills inline against
/// elapsed monotonic time on each `acquire` rather than from a background
/// tick task, per §4.4's literal algorithm.
pub struct TokenBucket {
    rate: AtomicU64,
    burst_size: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts with a full burst of credit, as a freshly-opened bucket has
    /// never been drained.
    pub fn new(rate_bytes_per_second: u64, burst_size: u64) -> Self {
        Self {
            rate: AtomicU64::new(rate_bytes_per_second.max(1)),
            burst_size,
            state: Mutex::new(BucketState { credits: burst_size, last_refill: Instant::now() }),
        }
    }

    pub fn with_default_burst(rate_bytes_per_second: u64) -> Self {
        Self::new(rate_bytes_per_second, DEFAULT_BURST_BYTES)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.last_refill = now;
        let rate = self.rate.load(Ordering::Relaxed);
        let add = (rate as f64 * elapsed.as_secs_f64()) as u64;
        state.credits = (state.credits.saturating_add(add)).min(self.burst_size);
    }
}

#[async_trait]
impl SpeedLimiter for TokenBucket {
    async fn acquire(&self, n: u64) {
        let mut remaining = n;
        if remaining == 0 {
            return;
        }
        loop {
            let rate = {
                let mut state = self.state.lock().unwrap();
                self.refill(&mut state);
                let take = state.credits.min(remaining).min(self.burst_size);
                state.credits -= take;
                remaining -= take;
                self.rate.load(Ordering::Relaxed)
            };
            if remaining == 0 {
                return;
            }
            // One refill cycle can only ever produce up to `burst_size`
            // more credit, so only wait long enough to cover that much of
            // the shortfall before looping back to refill and deduct again.
            let needed = remaining.min(self.burst_size);
            let needed_secs = needed as f64 / rate.max(1) as f64;
            let sleep_ms = (needed_secs * 1000.0).max(1.0) as u64;
            tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
        }
    }

    fn update_rate(&self, bytes_per_second: u64) -> bool {
        self.rate.store(bytes_per_second.max(1), Ordering::Relaxed);
        true
    }
}
