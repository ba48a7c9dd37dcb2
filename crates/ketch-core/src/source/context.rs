//! The per-task collaborator bundle a `DownloadSource` operates against
//! (§4.5 step 3): request/resolved metadata, mutable segments, the
//! throttle, and the progress callback. Built by the (not-yet-written)
//! coordinator once per active task and shared with the source as an
//! `Arc`, since segment fetches run as independent spawned tasks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::http::{CancelSignal, HttpEngine};
use crate::limiter::DelegatingSpeedLimiter;
use crate::model::{DownloadRequest, ResolvedSource, Segment};
use crate::retry::RetryPolicy;
use crate::storage::FileAccessor;

/// Shared mutable state plus the collaborators a source needs to execute
/// or resume a download. Cheap to clone (everything inside is an `Arc`).
pub struct DownloadContext {
    pub request: DownloadRequest,
    pub resolved: ResolvedSource,
    segments: Mutex<Vec<Segment>>,
    max_connections: AtomicUsize,
    pub file_accessor: Arc<dyn FileAccessor>,
    pub http: Arc<dyn HttpEngine>,
    pub limiter: Arc<DelegatingSpeedLimiter>,
    pub retry_policy: RetryPolicy,
    pub cancel: CancelSignal,
    progress: Box<dyn Fn(i64, i64) + Send + Sync>,
}

impl DownloadContext {
    pub fn new(
        request: DownloadRequest,
        resolved: ResolvedSource,
        segments: Vec<Segment>,
        max_connections: usize,
        file_accessor: Arc<dyn FileAccessor>,
        http: Arc<dyn HttpEngine>,
        limiter: Arc<DelegatingSpeedLimiter>,
        retry_policy: RetryPolicy,
        progress: impl Fn(i64, i64) + Send + Sync + 'static,
    ) -> Self {
        Self {
            request,
            resolved,
            segments: Mutex::new(segments),
            max_connections: AtomicUsize::new(max_connections),
            file_accessor,
            http,
            limiter,
            retry_policy,
            cancel: CancelSignal::new(),
            progress: Box::new(progress),
        }
    }

    pub fn segments_snapshot(&self) -> Vec<Segment> {
        self.segments.lock().unwrap().clone()
    }

    pub fn set_segments(&self, segments: Vec<Segment>) {
        *self.segments.lock().unwrap() = segments;
    }

    /// Adds `delta` bytes to segment `index` and returns the new
    /// task-wide total of `downloaded_bytes` across all segments.
    pub fn record_segment_progress(&self, index: usize, delta: i64) -> i64 {
        let mut segments = self.segments.lock().unwrap();
        segments[index].downloaded_bytes += delta;
        segments.iter().map(|s| s.downloaded_bytes).sum()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections.load(Ordering::Relaxed)
    }

    pub fn set_max_connections(&self, n: usize) {
        self.max_connections.store(n.max(1), Ordering::Relaxed);
    }

    pub async fn throttle(&self, n: u64) {
        if n > 0 {
            self.limiter.acquire(n).await;
        }
    }

    pub fn on_progress(&self, downloaded: i64, total: i64) {
        (self.progress)(downloaded, total);
    }
}
