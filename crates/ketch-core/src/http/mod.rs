//! `HttpEngine` (§6.1): the pluggable HTTP transport, consumed through a
//! narrow trait so the coordinator never touches concrete HTTP types (§9
//! Design Notes, "Pluggable transport").

mod curl_engine;
mod rate_limit;

pub use curl_engine::CurlHttpEngine;
pub use rate_limit::parse_rate_limit_hints;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KetchError;
use crate::model::ServerInfo;

/// Inclusive byte range for a ranged GET.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: i64,
}

/// Cooperative cancellation flag checked at chunk boundaries (§5
/// "Cancellation: structured"). Cloneable; cheap to share with the
/// blocking worker thread driving curl.
#[derive(Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Receives raw bytes as they arrive. Implementations write them at the
/// correct file offset and advance progress counters.
pub type ChunkSink = Box<dyn FnMut(&[u8]) -> Result<(), KetchError> + Send>;

/// Pluggable HTTP transport (§6.1, consumed). `head` probes a resource;
/// `download` streams bytes until EOF, error, or cancellation.
#[async_trait]
pub trait HttpEngine: Send + Sync {
    async fn head(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError>;

    /// `range = None` means a full-body GET. Must honor `cancel` at chunk
    /// boundaries: once set, the current write still completes but no
    /// further bytes are requested (§5).
    async fn download(
        &self,
        url: &str,
        range: Option<ByteRange>,
        headers: &BTreeMap<String, String>,
        sink: ChunkSink,
        cancel: CancelSignal,
    ) -> Result<(), KetchError>;
}
