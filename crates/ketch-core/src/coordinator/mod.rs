//! `DownloadCoordinator` (§4.5): drives a single task from resolved source
//! to terminal state — plans/preallocates, spawns segment workers through
//! the task's `DownloadSource`, persists and publishes progress, and
//! finalizes on completion, pause, cancellation, or failure.
//!
//! Progress and segment updates flow back over an mpsc channel into a
//! background persistence task; resuming a task always re-probes the
//! source first so a changed remote file is caught before any bytes move.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::{KetchConfig, SpeedLimit};
use crate::error::KetchError;
use crate::http::HttpEngine;
use crate::limiter::{DelegatingSpeedLimiter, SpeedLimiter, TokenBucket, Unlimited};
use crate::model::request::{Destination, DownloadRequest};
use crate::model::{
    DownloadProgress, DownloadState, ResolvedSource, SelectionMode, Segment, TaskId, TaskRecord, TaskState,
};
use crate::observable::Cell;
use crate::retry::RetryPolicy;
use crate::source::{DownloadContext, DownloadSource, SourceResolver};
use crate::storage::{temp_path, FileAccessor, LocalFileAccessor, NullFileAccessor};
use crate::store::TaskStore;

/// Observable cells a caller subscribes to before calling `start`/`resume`,
/// so no update is missed between task creation and execution start (§6.5).
#[derive(Clone)]
pub struct TaskObservers {
    pub state: Arc<Cell<DownloadState>>,
    pub segments: Arc<Cell<Vec<Segment>>>,
}

impl TaskObservers {
    pub fn new() -> Self {
        Self { state: Arc::new(Cell::new(DownloadState::Idle)), segments: Arc::new(Cell::new(Vec::new())) }
    }
}

impl Default for TaskObservers {
    fn default() -> Self {
        Self::new()
    }
}

/// Cadence knobs carried over from `KetchConfig` (§6.6).
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub retry_policy: RetryPolicy,
    pub progress_update_interval: Duration,
    pub segment_save_interval: Duration,
}

impl From<&KetchConfig> for CoordinatorConfig {
    fn from(cfg: &KetchConfig) -> Self {
        Self {
            retry_policy: RetryPolicy::from_config(cfg.retry_count, cfg.retry_delay_ms),
            progress_update_interval: Duration::from_millis(cfg.progress_update_interval_ms),
            segment_save_interval: Duration::from_millis(cfg.segment_save_interval_ms),
        }
    }
}

/// What a caller asked for while the driver task was in flight; consumed
/// once the driver observes `KetchError::Canceled` from the source, since
/// both `pause` and `cancel` work by setting the same cancel signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    None,
    Pause,
    Cancel,
}

/// Bookkeeping for one in-flight task. The driver task spawned in
/// `spawn_execution` is the sole owner of its `JoinHandle` and performs
/// all finalization itself; external callers only set `pending_action`,
/// flip the cancel signal, and wait on `done`.
struct TaskExecution {
    ctx: Arc<DownloadContext>,
    pending_action: Arc<StdMutex<PendingAction>>,
    done: Arc<Cell<bool>>,
}

enum ExecutionMode {
    Start,
    Resume(crate::model::SourceResumeState),
}

/// Orchestrates task execution (§4.5): resolves the source, builds the
/// per-task collaborators, spawns the driver, and owns every in-flight
/// task's cancellation handle and pause/cancel intent.
pub struct DownloadCoordinator {
    resolver: Arc<SourceResolver>,
    store: Arc<dyn TaskStore>,
    http: Arc<dyn HttpEngine>,
    global_limiter: Arc<dyn SpeedLimiter>,
    config: CoordinatorConfig,
    executions: Arc<AsyncMutex<HashMap<TaskId, TaskExecution>>>,
}

impl DownloadCoordinator {
    pub fn new(
        resolver: Arc<SourceResolver>,
        store: Arc<dyn TaskStore>,
        http: Arc<dyn HttpEngine>,
        global_limiter: Arc<dyn SpeedLimiter>,
        config: CoordinatorConfig,
    ) -> Self {
        Self { resolver, store, http, global_limiter, config, executions: Arc::new(AsyncMutex::new(HashMap::new())) }
    }

    /// Resolves the source fresh and begins a first download (§4.5 steps
    /// 1-3). `record.state` is expected to already be `Queued`/`Pending`.
    pub async fn start(&self, mut record: TaskRecord, observers: TaskObservers) -> Result<(), KetchError> {
        let request = record.request.to_request();
        let source = self.resolver.resolve_for(&request.url)?;
        let resolved = source.resolve(&request.url, &request.headers).await?;

        let output_path = resolve_output_path(&request, &resolved);
        record.total_bytes = resolved.total_bytes;
        record.output_path = Some(output_path.to_string_lossy().into_owned());
        record.state = TaskState::Downloading;
        record.updated_at = unix_timestamp();
        self.store.save(&record).await?;

        let file_accessor = self.open_file_accessor(source.as_ref(), &output_path, false)?;

        self.spawn_execution(record, request, resolved, Vec::new(), source, file_accessor, output_path, observers, ExecutionMode::Start)
            .await
    }

    /// Resumes a previously paused task (§4.5 `resume`). `record.segments`
    /// and `record.source_resume_state` must already be populated, as left
    /// behind by a prior `pause`. `destination_override` lets a caller
    /// redirect the output file; when absent the recorded `output_path` is
    /// reused.
    pub async fn resume(
        &self,
        mut record: TaskRecord,
        observers: TaskObservers,
        destination_override: Option<PathBuf>,
    ) -> Result<(), KetchError> {
        let resume_state = record.source_resume_state.clone().ok_or(KetchError::CorruptResumeState)?;
        let segments = record.segments.clone().ok_or(KetchError::CorruptResumeState)?;

        let mut request = record.request.to_request();
        let source = self.resolver.resolve_for(&request.url)?;

        let output_path = match destination_override {
            Some(path) => path,
            None => record.output_path.as_ref().map(PathBuf::from).ok_or(KetchError::CorruptResumeState)?,
        };
        if let Some(parent) = output_path.parent() {
            request.destination = Destination::Directory(parent.to_path_buf());
        }

        // `ResolvedSource` is never persisted on `TaskRecord` (§6.3);
        // reconstruct the minimal placeholder the source's `resume` needs.
        // A `SourceResumeState` could only exist if resume was previously
        // supported, so `supports_resume: true` here is safe.
        let resolved = ResolvedSource {
            url: request.url.clone(),
            source_type: resume_state.source_type.clone(),
            total_bytes: record.total_bytes,
            supports_resume: true,
            suggested_file_name: output_path.file_name().map(|n| n.to_string_lossy().into_owned()),
            max_segments: request.connections,
            metadata: std::collections::BTreeMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        };

        record.state = TaskState::Downloading;
        record.updated_at = unix_timestamp();
        self.store.save(&record).await?;

        let file_accessor = self.open_file_accessor(source.as_ref(), &output_path, true)?;

        self.spawn_execution(record, request, resolved, segments, source, file_accessor, output_path, observers, ExecutionMode::Resume(resume_state))
            .await
    }

    /// Requests a graceful pause: sets intent, flips the cancel signal, and
    /// waits for the driver to persist `Paused` state and exit.
    pub async fn pause(&self, task_id: TaskId) -> Result<(), KetchError> {
        self.request_stop(task_id, PendingAction::Pause).await
    }

    /// Requests cancellation: sets intent, flips the cancel signal, and
    /// waits for the driver to discard the partial file and exit.
    pub async fn cancel(&self, task_id: TaskId) -> Result<(), KetchError> {
        self.request_stop(task_id, PendingAction::Cancel).await
    }

    /// Changes a running task's speed cap (§4.4). Tries an in-place rate
    /// update first and falls back to swapping the inner limiter when the
    /// current one has no rate concept (`Unlimited`).
    pub async fn set_task_speed_limit(&self, task_id: TaskId, speed_limit: SpeedLimit) -> Result<(), KetchError> {
        let limiter = {
            let executions = self.executions.lock().await;
            executions
                .get(&task_id)
                .map(|e| e.ctx.limiter.clone())
                .ok_or_else(|| KetchError::Unsupported(format!("no active task {task_id}")))?
        };
        match speed_limit {
            SpeedLimit::Unlimited => limiter.set_inner(Arc::new(Unlimited)).await,
            SpeedLimit::BytesPerSecond(rate) => {
                if !limiter.try_update_rate(rate).await {
                    limiter.set_inner(Arc::new(TokenBucket::with_default_burst(rate))).await;
                }
            }
        }
        Ok(())
    }

    /// Updates the live connection count a running task's source observes.
    /// `HttpDownloadSource` only re-partitions segments inside `resume()`
    /// (it reads the count once per `download()`/`resume()` call, not per
    /// segment), so taking effect immediately requires the caller to pause
    /// and resume the task; this just makes sure the next `resume()` (by
    /// this coordinator or another) sees the new value in the meantime.
    pub async fn set_task_connections(&self, task_id: TaskId, connections: usize) -> Result<(), KetchError> {
        let ctx = {
            let executions = self.executions.lock().await;
            executions
                .get(&task_id)
                .map(|e| e.ctx.clone())
                .ok_or_else(|| KetchError::Unsupported(format!("no active task {task_id}")))?
        };
        ctx.set_max_connections(connections.max(1));
        Ok(())
    }

    async fn request_stop(&self, task_id: TaskId, action: PendingAction) -> Result<(), KetchError> {
        let (cancel, done) = {
            let executions = self.executions.lock().await;
            let execution = executions
                .get(&task_id)
                .ok_or_else(|| KetchError::Unsupported(format!("no active task {task_id}")))?;
            *execution.pending_action.lock().unwrap() = action;
            (execution.ctx.cancel.clone(), execution.done.clone())
        };
        cancel.cancel();
        wait_for_done(&done).await;
        Ok(())
    }

    fn open_file_accessor(
        &self,
        source: &dyn DownloadSource,
        output_path: &Path,
        resume: bool,
    ) -> Result<Arc<dyn FileAccessor>, KetchError> {
        if source.manages_own_file_io() {
            return Ok(Arc::new(NullFileAccessor));
        }
        if let Some(parent) = output_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| KetchError::Disk(anyhow::Error::new(e)))?;
        }
        let temp = temp_path(output_path);
        if resume && temp.exists() {
            Ok(Arc::new(LocalFileAccessor::open_existing(&temp)?))
        } else {
            Ok(Arc::new(LocalFileAccessor::create(&temp, 0)?))
        }
    }

    /// Builds the `DownloadContext`, registers the task, and spawns both
    /// the progress/persistence saver and the driver that runs the
    /// source's `download`/`resume` to completion.
    #[allow(clippy::too_many_arguments)]
    async fn spawn_execution(
        &self,
        record: TaskRecord,
        request: DownloadRequest,
        resolved: ResolvedSource,
        segments: Vec<Segment>,
        source: Arc<dyn DownloadSource>,
        file_accessor: Arc<dyn FileAccessor>,
        output_path: PathBuf,
        observers: TaskObservers,
        mode: ExecutionMode,
    ) -> Result<(), KetchError> {
        let task_id = record.task_id;
        let limiter = Arc::new(DelegatingSpeedLimiter::for_task(self.global_limiter.clone(), speed_limit_to_limiter(request.speed_limit)));

        let (save_tx, save_rx) = mpsc::channel::<()>(8);
        let last_progress_send = Arc::new(StdMutex::new(Instant::now() - self.config.progress_update_interval));
        let progress_update_interval = self.config.progress_update_interval;
        let progress_tx = save_tx.clone();
        let on_progress = move |_downloaded: i64, _total: i64| {
            let mut last = last_progress_send.lock().unwrap();
            if last.elapsed() >= progress_update_interval {
                *last = Instant::now();
                let _ = progress_tx.try_send(());
            }
        };

        let ctx = Arc::new(DownloadContext::new(
            request,
            resolved,
            segments,
            record.request.connections,
            file_accessor.clone(),
            self.http.clone(),
            limiter,
            self.config.retry_policy,
            on_progress,
        ));

        observers.segments.set(ctx.segments_snapshot());
        observers.state.set(DownloadState::Downloading(DownloadProgress::new(
            record.downloaded_bytes,
            record.total_bytes,
            0.0,
        )));

        let pending_action = Arc::new(StdMutex::new(PendingAction::None));
        let done = Arc::new(Cell::new(false));

        self.executions.lock().await.insert(
            task_id,
            TaskExecution { ctx: ctx.clone(), pending_action: pending_action.clone(), done: done.clone() },
        );

        tokio::spawn(run_saver(
            self.store.clone(),
            ctx.clone(),
            observers.clone(),
            record.clone(),
            self.config.segment_save_interval,
            save_rx,
        ));

        tokio::spawn(run_driver(
            self.store.clone(),
            self.executions.clone(),
            source,
            ctx,
            observers,
            record,
            output_path,
            file_accessor,
            pending_action,
            done,
            mode,
        ));

        Ok(())
    }
}

async fn wait_for_done(done: &Cell<bool>) {
    if done.get() {
        return;
    }
    let mut reader = done.reader();
    while !reader.get() {
        if reader.changed().await.is_none() {
            break;
        }
    }
}

fn speed_limit_to_limiter(speed_limit: SpeedLimit) -> Arc<dyn SpeedLimiter> {
    match speed_limit {
        SpeedLimit::Unlimited => Arc::new(Unlimited),
        SpeedLimit::BytesPerSecond(rate) => Arc::new(TokenBucket::with_default_burst(rate)),
    }
}

fn resolve_output_path(request: &DownloadRequest, resolved: &ResolvedSource) -> PathBuf {
    match &request.destination {
        Destination::File(path) => path.clone(),
        Destination::Directory(dir) => {
            let name = request
                .file_name
                .clone()
                .or_else(|| resolved.suggested_file_name.clone())
                .unwrap_or_else(|| "download".to_string());
            dir.join(name)
        }
    }
}

fn unix_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Background task: receives a throttled signal on every synchronous
/// progress callback, republishes the observable cells, and persists a
/// segment snapshot on a coarser, independently tracked interval. Exits
/// once every `Sender` (held by `on_progress`) is dropped, which happens
/// when the driver removes the task's `DownloadContext` from the
/// coordinator's map.
async fn run_saver(
    store: Arc<dyn TaskStore>,
    ctx: Arc<DownloadContext>,
    observers: TaskObservers,
    mut record: TaskRecord,
    segment_save_interval: Duration,
    mut save_rx: mpsc::Receiver<()>,
) {
    let mut last_saved = Instant::now() - segment_save_interval;
    let mut last_downloaded = record.downloaded_bytes;
    let mut last_sample = Instant::now();

    while save_rx.recv().await.is_some() {
        let segments = ctx.segments_snapshot();
        let downloaded: i64 = segments.iter().map(|s| s.downloaded_bytes).sum();
        let total = ctx.resolved.total_bytes;

        let now = Instant::now();
        let elapsed = now.duration_since(last_sample).as_secs_f64();
        let bytes_per_second = if elapsed > 0.0 { ((downloaded - last_downloaded).max(0)) as f64 / elapsed } else { 0.0 };
        last_downloaded = downloaded;
        last_sample = now;

        observers.segments.set(segments.clone());
        observers.state.set(DownloadState::Downloading(DownloadProgress::new(downloaded, total, bytes_per_second)));

        if last_saved.elapsed() >= segment_save_interval {
            last_saved = Instant::now();
            record.downloaded_bytes = downloaded;
            record.segments = Some(segments);
            record.updated_at = unix_timestamp();
            if let Err(e) = store.save(&record).await {
                tracing::warn!(task_id = %record.task_id, error = %e, "failed to persist progress snapshot");
            }
        }
    }
}

/// Runs the source's `download`/`resume` to completion and performs all
/// terminal-state handling inline: this task is the sole owner of its
/// `JoinHandle`, so it is the only place allowed to decide the task is
/// done. External callers (`pause`/`cancel`) only set `pending_action` and
/// the cancel signal, then wait on `done`.
#[allow(clippy::too_many_arguments)]
async fn run_driver(
    store: Arc<dyn TaskStore>,
    executions: Arc<AsyncMutex<HashMap<TaskId, TaskExecution>>>,
    source: Arc<dyn DownloadSource>,
    ctx: Arc<DownloadContext>,
    observers: TaskObservers,
    mut record: TaskRecord,
    output_path: PathBuf,
    file_accessor: Arc<dyn FileAccessor>,
    pending_action: Arc<StdMutex<PendingAction>>,
    done: Arc<Cell<bool>>,
    mode: ExecutionMode,
) {
    let task_id = record.task_id;
    let result = match &mode {
        ExecutionMode::Start => source.download(ctx.clone()).await,
        ExecutionMode::Resume(state) => source.resume(ctx.clone(), state).await,
    };

    match result {
        Ok(()) => {
            if let Err(e) = file_accessor.close(&output_path) {
                tracing::error!(task_id = %task_id, error = %e, "failed to finalize output file");
            }
            record.state = TaskState::Completed;
            record.output_path = Some(output_path.to_string_lossy().into_owned());
            record.downloaded_bytes = record.total_bytes.max(0);
            record.segments = None;
            record.source_resume_state = None;
            record.error_message = None;
            record.updated_at = unix_timestamp();
            if let Err(e) = store.save(&record).await {
                tracing::warn!(task_id = %task_id, error = %e, "failed to persist completed state");
            }
            observers.state.set(DownloadState::Completed(output_path));
            tracing::info!(task_id = %task_id, "download completed");
        }
        Err(KetchError::Canceled) => {
            let action = std::mem::replace(&mut *pending_action.lock().unwrap(), PendingAction::None);
            match action {
                PendingAction::Pause => finalize_paused(&store, &source, &ctx, &observers, &mut record).await,
                PendingAction::Cancel | PendingAction::None => {
                    let _ = file_accessor.delete();
                    if let Err(e) = store.remove(&task_id).await {
                        tracing::warn!(task_id = %task_id, error = %e, "failed to remove canceled task record");
                    }
                    observers.state.set(DownloadState::Canceled);
                    tracing::info!(task_id = %task_id, "download canceled");
                }
            }
        }
        Err(e) => {
            let e = Arc::new(e);
            record.state = TaskState::Failed;
            record.error_message = Some(e.to_string());
            record.updated_at = unix_timestamp();
            if let Err(save_err) = store.save(&record).await {
                tracing::warn!(task_id = %task_id, error = %save_err, "failed to persist failed state");
            }
            observers.state.set(DownloadState::Failed(e.clone()));
            tracing::warn!(task_id = %task_id, error = %e, "download failed");
        }
    }

    executions.lock().await.remove(&task_id);
    done.set(true);
}

async fn finalize_paused(
    store: &Arc<dyn TaskStore>,
    source: &Arc<dyn DownloadSource>,
    ctx: &Arc<DownloadContext>,
    observers: &TaskObservers,
    record: &mut TaskRecord,
) {
    let segments = ctx.segments_snapshot();
    let downloaded: i64 = segments.iter().map(|s| s.downloaded_bytes).sum();
    let total = ctx.resolved.total_bytes;

    let resume_state = match source.build_resume_state(&ctx.resolved, total).await {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::warn!(task_id = %record.task_id, error = %e, "failed to build resume state; task will restart from scratch on resume");
            None
        }
    };

    record.state = TaskState::Paused;
    record.downloaded_bytes = downloaded;
    record.segments = Some(segments.clone());
    record.source_resume_state = resume_state;
    record.updated_at = unix_timestamp();
    if let Err(e) = store.save(record).await {
        tracing::warn!(task_id = %record.task_id, error = %e, "failed to persist paused state");
    }

    observers.segments.set(segments);
    observers.state.set(DownloadState::Paused(DownloadProgress::new(downloaded, total, 0.0)));
    tracing::info!(task_id = %record.task_id, "download paused");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{ByteRange, CancelSignal, ChunkSink};
    use crate::model::{Destination, DownloadRequest, DownloadRequestRecord, ServerInfo};
    use crate::store::SqliteTaskStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct StubHttpEngine {
        body: Vec<u8>,
    }

    #[async_trait]
    impl HttpEngine for StubHttpEngine {
        async fn head(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError> {
            Ok(ServerInfo {
                content_length: Some(self.body.len() as i64),
                accepts_byte_ranges: true,
                etag: Some("\"v1\"".to_string()),
                last_modified: None,
                content_disposition: None,
                rate_limit_remaining: None,
                rate_limit_reset: None,
            })
        }

        async fn download(
            &self,
            _url: &str,
            range: Option<ByteRange>,
            _headers: &BTreeMap<String, String>,
            mut sink: ChunkSink,
            _cancel: CancelSignal,
        ) -> Result<(), KetchError> {
            let slice = match range {
                Some(r) => &self.body[r.start as usize..=r.end as usize],
                None => &self.body[..],
            };
            sink(slice)
        }
    }

    struct BlockingHttpEngine {
        release: Arc<tokio::sync::Notify>,
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HttpEngine for BlockingHttpEngine {
        async fn head(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError> {
            Ok(ServerInfo {
                content_length: Some(1024),
                accepts_byte_ranges: true,
                etag: Some("\"v1\"".to_string()),
                last_modified: None,
                content_disposition: None,
                rate_limit_remaining: None,
                rate_limit_reset: None,
            })
        }

        async fn download(
            &self,
            _url: &str,
            _range: Option<ByteRange>,
            _headers: &BTreeMap<String, String>,
            _sink: ChunkSink,
            cancel: CancelSignal,
        ) -> Result<(), KetchError> {
            self.started.store(true, Ordering::SeqCst);
            loop {
                if cancel.is_canceled() {
                    return Err(KetchError::Canceled);
                }
                tokio::select! {
                    _ = self.release.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {}
                }
                if cancel.is_canceled() {
                    return Err(KetchError::Canceled);
                }
            }
        }
    }

    fn sample_request() -> DownloadRequest {
        let mut req = DownloadRequest::new("https://example.com/f.bin", Destination::Directory(std::env::temp_dir()));
        req.connections = 2;
        req
    }

    fn sample_record(req: &DownloadRequest) -> TaskRecord {
        TaskRecord {
            task_id: TaskId::new(),
            request: DownloadRequestRecord::from(req),
            state: TaskState::Queued,
            created_at: 0,
            updated_at: 0,
            total_bytes: -1,
            downloaded_bytes: 0,
            output_path: None,
            segments: None,
            source_resume_state: None,
            error_message: None,
        }
    }

    async fn build_coordinator(http: Arc<dyn HttpEngine>) -> (DownloadCoordinator, Arc<dyn TaskStore>) {
        let http_source = Arc::new(crate::source::HttpDownloadSource::new(http.clone(), 4));
        let resolver = Arc::new(SourceResolver::new(vec![http_source]));
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_path("sqlite::memory:").await.unwrap());
        let config = CoordinatorConfig::from(&KetchConfig::default());
        let coordinator = DownloadCoordinator::new(resolver, store.clone(), http, Arc::new(Unlimited), config);
        (coordinator, store)
    }

    #[tokio::test]
    async fn start_runs_to_completion_and_persists_completed_state() {
        let body = b"hello world".to_vec();
        let http: Arc<dyn HttpEngine> = Arc::new(StubHttpEngine { body: body.clone() });
        let (coordinator, store) = build_coordinator(http).await;

        let req = sample_request();
        let record = sample_record(&req);
        let task_id = record.task_id;
        let observers = TaskObservers::new();
        let mut state_reader = observers.state.reader();

        coordinator.start(record, observers).await.unwrap();

        loop {
            match state_reader.changed().await {
                Some(DownloadState::Completed(_)) => break,
                Some(_) => continue,
                None => panic!("state channel closed before completion"),
            }
        }

        let stored = store.load(&task_id).await.unwrap().expect("record persisted");
        assert_eq!(stored.state, TaskState::Completed);
        assert_eq!(stored.downloaded_bytes, body.len() as i64);

        let output_path = PathBuf::from(stored.output_path.unwrap());
        let contents = std::fs::read(&output_path).unwrap();
        assert_eq!(contents, body);
        std::fs::remove_file(&output_path).ok();
    }

    #[tokio::test]
    async fn pause_persists_resume_state_and_segments() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> =
            Arc::new(BlockingHttpEngine { release: release.clone(), started: started.clone() });
        let (coordinator, store) = build_coordinator(http).await;

        let req = sample_request();
        let record = sample_record(&req);
        let task_id = record.task_id;
        let observers = TaskObservers::new();

        coordinator.start(record, observers).await.unwrap();

        for _ in 0..200 {
            if started.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(started.load(Ordering::SeqCst));

        coordinator.pause(task_id).await.unwrap();

        let stored = store.load(&task_id).await.unwrap().expect("record persisted");
        assert_eq!(stored.state, TaskState::Paused);
        assert!(stored.segments.is_some());
        assert!(stored.source_resume_state.is_some());
    }

    #[tokio::test]
    async fn cancel_removes_task_record() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> =
            Arc::new(BlockingHttpEngine { release: release.clone(), started: started.clone() });
        let (coordinator, store) = build_coordinator(http).await;

        let req = sample_request();
        let record = sample_record(&req);
        let task_id = record.task_id;
        let observers = TaskObservers::new();

        coordinator.start(record, observers).await.unwrap();

        for _ in 0..200 {
            if started.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        coordinator.cancel(task_id).await.unwrap();

        assert!(store.load(&task_id).await.unwrap().is_none());
    }

    #[test]
    fn output_path_prefers_explicit_file_name_over_suggested() {
        let mut req = DownloadRequest::new("https://example.com/x", Destination::Directory("/tmp".into()));
        req.file_name = Some("chosen.bin".to_string());
        let resolved = ResolvedSource {
            url: req.url.clone(),
            source_type: "http".to_string(),
            total_bytes: 10,
            supports_resume: true,
            suggested_file_name: Some("suggested.bin".to_string()),
            max_segments: 4,
            metadata: BTreeMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        };
        assert_eq!(resolve_output_path(&req, &resolved), PathBuf::from("/tmp/chosen.bin"));
    }

    #[test]
    fn output_path_falls_back_to_suggested_name() {
        let req = DownloadRequest::new("https://example.com/x", Destination::Directory("/tmp".into()));
        let resolved = ResolvedSource {
            url: req.url.clone(),
            source_type: "http".to_string(),
            total_bytes: 10,
            supports_resume: true,
            suggested_file_name: Some("suggested.bin".to_string()),
            max_segments: 4,
            metadata: BTreeMap::new(),
            files: Vec::new(),
            selection_mode: SelectionMode::None,
        };
        assert_eq!(resolve_output_path(&req, &resolved), PathBuf::from("/tmp/suggested.bin"));
    }
}
