//! Pluggable protocol handlers (§4.2, §4.3, §6.4). `HttpDownloadSource` is
//! the only built-in implementation; `SourceResolver` picks the first
//! registered source whose `can_handle` matches, an ordered chain the
//! core engine never needs to know the concrete members of.

mod context;
mod http_source;
mod resolver;

pub use context::DownloadContext;
pub use http_source::HttpDownloadSource;
pub use resolver::SourceResolver;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KetchError;
use crate::model::{ResolvedSource, SourceResumeState};

/// A pluggable protocol handler (§6.4). The engine only ever talks to
/// sources through this trait; `HttpDownloadSource` is the one built-in
/// implementation behind it.
#[async_trait]
pub trait DownloadSource: Send + Sync {
    /// Stable identifier stored in `ResolvedSource::source_type` and
    /// `SourceResumeState::source_type`.
    fn source_type(&self) -> &'static str;

    fn can_handle(&self, url: &str) -> bool;

    /// True if this source writes the destination file itself and the
    /// coordinator should not open a `FileAccessor` on its behalf.
    fn manages_own_file_io(&self) -> bool {
        false
    }

    async fn resolve(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<ResolvedSource, KetchError>;

    async fn download(&self, ctx: Arc<DownloadContext>) -> Result<(), KetchError>;

    async fn resume(&self, ctx: Arc<DownloadContext>, state: &SourceResumeState) -> Result<(), KetchError>;

    async fn build_resume_state(&self, resolved: &ResolvedSource, total_bytes: i64) -> Result<SourceResumeState, KetchError>;
}
