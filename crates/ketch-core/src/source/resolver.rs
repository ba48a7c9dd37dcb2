//! `SourceResolver` (§4.3): an ordered list, first `can_handle` match wins.

use std::sync::Arc;

use crate::error::KetchError;
use crate::source::DownloadSource;

/// Keeps `[user-supplied sources..., HttpDownloadSource]` in registration
/// order and dispatches on the first match.
pub struct SourceResolver {
    sources: Vec<Arc<dyn DownloadSource>>,
}

impl SourceResolver {
    pub fn new(sources: Vec<Arc<dyn DownloadSource>>) -> Self {
        Self { sources }
    }

    pub fn resolve_for(&self, url: &str) -> Result<Arc<dyn DownloadSource>, KetchError> {
        self.sources
            .iter()
            .find(|s| s.can_handle(url))
            .cloned()
            .ok_or_else(|| KetchError::Unsupported(format!("no source handles {url}")))
    }
}
