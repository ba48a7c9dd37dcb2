//! `HttpDownloadSource` (§4.2): the built-in `http`/`https` protocol
//! handler. `resolve` probes the server with HEAD; `download`/`resume`
//! fetch a byte range and validate the server identity (etag/last-modified/
//! size) hasn't changed since the original probe before trusting a resume.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::KetchError;
use crate::filename;
use crate::http::{ByteRange, ChunkSink, HttpEngine};
use crate::model::{HttpResumeData, ResolvedSource, Segment, SelectionMode, SourceResumeState};
use crate::retry::run_with_retry;
use crate::segmenter;
use crate::source::{DownloadContext, DownloadSource};

const SOURCE_TYPE: &str = "http";

pub struct HttpDownloadSource {
    http: Arc<dyn HttpEngine>,
    default_max_segments: usize,
}

impl HttpDownloadSource {
    pub fn new(http: Arc<dyn HttpEngine>, default_max_segments: usize) -> Self {
        Self { http, default_max_segments: default_max_segments.max(1) }
    }

    async fn run_segments(&self, ctx: &Arc<DownloadContext>) -> Result<(), KetchError> {
        let pending: Vec<usize> = ctx
            .segments_snapshot()
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_complete())
            .map(|(i, _)| i)
            .collect();

        let mut handles = Vec::with_capacity(pending.len());
        for index in pending {
            let ctx = ctx.clone();
            let http = self.http.clone();
            handles.push(tokio::spawn(async move {
                let policy = ctx.retry_policy;
                run_with_retry(&policy, || {
                    let ctx = ctx.clone();
                    let http = http.clone();
                    async move { fetch_segment_once(&ctx, &http, index).await }
                })
                .await
            }));
        }

        let mut first_err = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    ctx.cancel.cancel();
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => {
                    ctx.cancel.cancel();
                    if first_err.is_none() {
                        first_err = Some(KetchError::Unknown(anyhow::anyhow!("segment task panicked: {join_err}")));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DownloadSource for HttpDownloadSource {
    fn source_type(&self) -> &'static str {
        SOURCE_TYPE
    }

    fn can_handle(&self, url: &str) -> bool {
        url.starts_with("http://") || url.starts_with("https://")
    }

    async fn resolve(&self, url: &str, headers: &BTreeMap<String, String>) -> Result<ResolvedSource, KetchError> {
        let info = self.http.head(url, headers).await?;
        let supports_resume = info.supports_resume();
        let suggested_file_name = filename::derive_filename(url, info.content_disposition.as_deref());

        let mut metadata = BTreeMap::new();
        if let Some(etag) = &info.etag {
            metadata.insert("etag".to_string(), etag.clone());
        }
        if let Some(last_modified) = &info.last_modified {
            metadata.insert("last_modified".to_string(), last_modified.clone());
        }

        Ok(ResolvedSource {
            url: url.to_string(),
            source_type: SOURCE_TYPE.to_string(),
            total_bytes: info.content_length.unwrap_or(-1),
            supports_resume,
            suggested_file_name: Some(suggested_file_name),
            max_segments: self.default_max_segments,
            metadata,
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        })
    }

    async fn download(&self, ctx: Arc<DownloadContext>) -> Result<(), KetchError> {
        let total_bytes = ctx.resolved.total_bytes;
        if total_bytes > 0 {
            ctx.file_accessor.preallocate(total_bytes)?;
        }

        let connections = ctx.max_connections().min(ctx.resolved.max_segments).max(1);
        let segments = segmenter::plan(total_bytes, connections, ctx.resolved.supports_resume);
        ctx.set_segments(segments);

        self.run_segments(&ctx).await?;
        ctx.file_accessor.flush()?;
        Ok(())
    }

    async fn resume(&self, ctx: Arc<DownloadContext>, state: &SourceResumeState) -> Result<(), KetchError> {
        if state.source_type != SOURCE_TYPE {
            return Err(KetchError::CorruptResumeState);
        }
        let saved = HttpResumeData::decode(&state.data).map_err(|_| KetchError::CorruptResumeState)?;

        let info = self.http.head(&ctx.request.url, &ctx.request.headers).await?;

        let identity_matches = if saved.etag.is_some() || saved.last_modified.is_some() {
            saved.etag == info.etag && saved.last_modified == info.last_modified
        } else {
            Some(saved.total_bytes) == info.content_length
        };
        if !identity_matches {
            return Err(KetchError::FileChanged);
        }

        let mut segments = ctx.segments_snapshot();
        let downloaded_sum: i64 = segments.iter().map(|s| s.downloaded_bytes).sum();
        let file_size = ctx.file_accessor.size()?;
        if file_size < downloaded_sum || (saved.total_bytes >= 0 && file_size > saved.total_bytes) {
            for segment in segments.iter_mut() {
                segment.downloaded_bytes = 0;
            }
            if saved.total_bytes > 0 {
                ctx.file_accessor.preallocate(saved.total_bytes)?;
            }
        }

        let incomplete_count = segments.iter().filter(|s: &&Segment| !s.is_complete()).count();
        let effective_connections = ctx.max_connections().min(ctx.resolved.max_segments).max(1);
        if incomplete_count != effective_connections {
            segments = segmenter::resegment(&segments, effective_connections);
        }
        ctx.set_segments(segments);

        self.run_segments(&ctx).await?;
        ctx.file_accessor.flush()?;
        Ok(())
    }

    async fn build_resume_state(&self, resolved: &ResolvedSource, total_bytes: i64) -> Result<SourceResumeState, KetchError> {
        let data = HttpResumeData {
            total_bytes,
            etag: resolved.metadata.get("etag").cloned(),
            last_modified: resolved.metadata.get("last_modified").cloned(),
        };
        let encoded = data.encode().map_err(|e| KetchError::Unknown(anyhow::Error::new(e)))?;
        Ok(SourceResumeState { source_type: SOURCE_TYPE.to_string(), data: encoded })
    }
}

/// One attempt at fetching whatever remains of `segments[index]`. Resumes
/// from the segment's current `downloaded_bytes` so a retried attempt
/// after a partial failure doesn't re-fetch bytes already written.
async fn fetch_segment_once(ctx: &Arc<DownloadContext>, http: &Arc<dyn HttpEngine>, index: usize) -> Result<(), KetchError> {
    let (segment, total_bytes) = {
        let segments = ctx.segments_snapshot();
        (segments[index], ctx.resolved.total_bytes)
    };
    if segment.is_complete() {
        return Ok(());
    }

    let range = if !ctx.resolved.supports_resume || segment.len() == 0 {
        None
    } else {
        Some(ByteRange { start: segment.start + segment.downloaded_bytes, end: segment.end })
    };

    let base_offset = segment.start + segment.downloaded_bytes;
    let written = Arc::new(AtomicI64::new(0));

    let sink: ChunkSink = {
        let written = written.clone();
        let ctx = ctx.clone();
        Box::new(move |data: &[u8]| -> Result<(), KetchError> {
            let handle = tokio::runtime::Handle::current();
            handle.block_on(ctx.throttle(data.len() as u64));

            let offset = written.fetch_add(data.len() as i64, Ordering::SeqCst);
            ctx.file_accessor.write_at(base_offset + offset, data)?;

            let total_downloaded = ctx.record_segment_progress(index, data.len() as i64);
            ctx.on_progress(total_downloaded, total_bytes);
            Ok(())
        })
    };

    http.download(&ctx.request.url, range, &ctx.request.headers, sink, ctx.cancel.clone()).await?;

    if ctx.cancel.is_canceled() {
        return Err(KetchError::Canceled);
    }

    if range.is_some() {
        let delivered = written.load(Ordering::SeqCst);
        let expected = segment.remaining();
        if delivered != expected {
            return Err(KetchError::Network(anyhow::anyhow!(
                "partial segment transfer: expected {expected} bytes, got {delivered}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpeedLimit;
    use crate::limiter::{DelegatingSpeedLimiter, Unlimited};
    use crate::model::{Destination, DownloadRequest};
    use crate::retry::RetryPolicy;
    use crate::storage::FileAccessor;
    use std::sync::Mutex as StdMutex;

    struct RecordingFileAccessor {
        writes: StdMutex<Vec<(i64, Vec<u8>)>>,
    }

    impl RecordingFileAccessor {
        fn new() -> Self {
            Self { writes: StdMutex::new(Vec::new()) }
        }
    }

    impl FileAccessor for RecordingFileAccessor {
        fn write_at(&self, offset: i64, data: &[u8]) -> Result<(), KetchError> {
            self.writes.lock().unwrap().push((offset, data.to_vec()));
            Ok(())
        }
        fn preallocate(&self, _size: i64) -> Result<(), KetchError> {
            Ok(())
        }
        fn size(&self) -> Result<i64, KetchError> {
            Ok(0)
        }
        fn flush(&self) -> Result<(), KetchError> {
            Ok(())
        }
        fn close(&self, _final_path: &std::path::Path) -> Result<(), KetchError> {
            Ok(())
        }
        fn delete(&self) -> Result<(), KetchError> {
            Ok(())
        }
    }

    struct StubHttpEngine {
        body: Vec<u8>,
    }

    #[async_trait]
    impl HttpEngine for StubHttpEngine {
        async fn head(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<crate::model::ServerInfo, KetchError> {
            unimplemented!()
        }

        async fn download(
            &self,
            _url: &str,
            range: Option<ByteRange>,
            _headers: &BTreeMap<String, String>,
            mut sink: ChunkSink,
            _cancel: crate::http::CancelSignal,
        ) -> Result<(), KetchError> {
            let slice = match range {
                Some(r) => &self.body[r.start as usize..=r.end as usize],
                None => &self.body[..],
            };
            sink(slice)
        }
    }

    fn test_context(resolved: ResolvedSource, segments: Vec<Segment>, file_accessor: Arc<dyn FileAccessor>) -> Arc<DownloadContext> {
        let request = DownloadRequest::new(resolved.url.clone(), Destination::Directory("/tmp".into()));
        let limiter = Arc::new(DelegatingSpeedLimiter::global(Arc::new(Unlimited)));
        Arc::new(DownloadContext::new(
            request,
            resolved,
            segments,
            4,
            file_accessor,
            Arc::new(StubHttpEngine { body: b"hello world".to_vec() }),
            limiter,
            RetryPolicy::default(),
            |_, _| {},
        ))
    }

    #[tokio::test]
    async fn fetch_segment_once_writes_at_segment_offset() {
        let file_accessor = Arc::new(RecordingFileAccessor::new());
        let resolved = ResolvedSource {
            url: "https://example.com/f".to_string(),
            source_type: SOURCE_TYPE.to_string(),
            total_bytes: 11,
            supports_resume: true,
            suggested_file_name: None,
            max_segments: 4,
            metadata: BTreeMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        };
        let segments = vec![Segment::new(0, 0, 10)];
        let ctx = test_context(resolved, segments, file_accessor.clone());
        let http: Arc<dyn HttpEngine> = Arc::new(StubHttpEngine { body: b"hello world".to_vec() });

        fetch_segment_once(&ctx, &http, 0).await.unwrap();

        let writes = file_accessor.writes.lock().unwrap();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0], (0, b"hello world".to_vec()));
    }

    #[tokio::test]
    async fn already_complete_segment_is_skipped() {
        let file_accessor = Arc::new(RecordingFileAccessor::new());
        let resolved = ResolvedSource {
            url: "https://example.com/f".to_string(),
            source_type: SOURCE_TYPE.to_string(),
            total_bytes: 11,
            supports_resume: true,
            suggested_file_name: None,
            max_segments: 4,
            metadata: BTreeMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        };
        let mut segment = Segment::new(0, 0, 10);
        segment.downloaded_bytes = 11;
        let ctx = test_context(resolved, vec![segment], file_accessor.clone());
        let http: Arc<dyn HttpEngine> = Arc::new(StubHttpEngine { body: b"hello world".to_vec() });

        fetch_segment_once(&ctx, &http, 0).await.unwrap();
        assert!(file_accessor.writes.lock().unwrap().is_empty());
    }
}
