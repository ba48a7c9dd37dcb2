//! `Ketch` (§4.8): wires coordinator, queue, and scheduler together behind a
//! single command loop, and hands callers a `DownloadTask` view per request.
//!
//! An `mpsc`-fed command loop owns all mutable engine state; callers get a
//! cheap `Clone` handle (here, `TaskController` impls) for sending commands
//! through. Per §9 Design Notes ("Lifecycle actions as a closure bundle"),
//! lifecycle actions are dispatched through a `TaskController` trait object
//! rather than a bundle of captured closures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use crate::config::{KetchConfig, SpeedLimit};
use crate::coordinator::{CoordinatorConfig, DownloadCoordinator, TaskObservers};
use crate::error::KetchError;
use crate::http::{CurlHttpEngine, HttpEngine};
use crate::limiter::{DelegatingSpeedLimiter, SpeedLimiter, Unlimited};
use crate::model::request::{Condition, DownloadRequest, Priority, Schedule};
use crate::model::{DownloadRequestRecord, DownloadState, Segment, TaskId, TaskRecord, TaskState};
use crate::observable::CellReader;
use crate::queue::DownloadQueue;
use crate::scheduler::DownloadScheduler;
use crate::source::{HttpDownloadSource, SourceResolver};
use crate::store::{SqliteTaskStore, TaskStore};

fn unix_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn channel_closed() -> KetchError {
    KetchError::Unsupported("engine is closed".to_string())
}

/// Lifecycle control surface a `DownloadTask` holds (§9 Design Notes). The
/// one implementation, `ChannelController`, forwards every call through the
/// engine's command channel so all mutation happens serialized on the
/// single command loop.
#[async_trait]
pub trait TaskController: Send + Sync {
    async fn pause(&self, task_id: TaskId) -> Result<(), KetchError>;
    async fn resume(&self, task_id: TaskId, destination_override: Option<PathBuf>) -> Result<(), KetchError>;
    async fn cancel(&self, task_id: TaskId) -> Result<(), KetchError>;
    async fn remove(&self, task_id: TaskId) -> Result<(), KetchError>;
    async fn set_speed_limit(&self, task_id: TaskId, limit: SpeedLimit) -> Result<(), KetchError>;
    async fn set_priority(&self, task_id: TaskId, priority: Priority) -> Result<(), KetchError>;
    async fn set_connections(&self, task_id: TaskId, connections: usize) -> Result<(), KetchError>;
    async fn reschedule(&self, task_id: TaskId, schedule: Schedule, conditions: Vec<Arc<dyn Condition>>) -> Result<(), KetchError>;
}

/// Per-task view object (§4.8): observable cells plus lifecycle controls.
/// Cheap to clone; every clone shares the same underlying cells and the
/// same controller.
#[derive(Clone)]
pub struct DownloadTask {
    task_id: TaskId,
    state: CellReader<DownloadState>,
    segments: CellReader<Vec<Segment>>,
    controller: Arc<dyn TaskController>,
}

impl DownloadTask {
    pub fn id(&self) -> TaskId {
        self.task_id
    }

    pub fn state(&self) -> DownloadState {
        self.state.get()
    }

    /// A fresh reader over the task's state cell, independent of this
    /// task's own cursor.
    pub fn watch_state(&self) -> CellReader<DownloadState> {
        self.state.clone()
    }

    pub fn segments(&self) -> Vec<Segment> {
        self.segments.get()
    }

    pub fn watch_segments(&self) -> CellReader<Vec<Segment>> {
        self.segments.clone()
    }

    pub async fn pause(&self) -> Result<(), KetchError> {
        self.controller.pause(self.task_id).await
    }

    pub async fn resume(&self, destination_override: Option<PathBuf>) -> Result<(), KetchError> {
        self.controller.resume(self.task_id, destination_override).await
    }

    pub async fn cancel(&self) -> Result<(), KetchError> {
        self.controller.cancel(self.task_id).await
    }

    pub async fn remove(&self) -> Result<(), KetchError> {
        self.controller.remove(self.task_id).await
    }

    pub async fn set_speed_limit(&self, limit: SpeedLimit) -> Result<(), KetchError> {
        self.controller.set_speed_limit(self.task_id, limit).await
    }

    pub async fn set_priority(&self, priority: Priority) -> Result<(), KetchError> {
        self.controller.set_priority(self.task_id, priority).await
    }

    pub async fn set_connections(&self, connections: usize) -> Result<(), KetchError> {
        self.controller.set_connections(self.task_id, connections).await
    }

    pub async fn reschedule(&self, schedule: Schedule, conditions: Vec<Arc<dyn Condition>>) -> Result<(), KetchError> {
        self.controller.reschedule(self.task_id, schedule, conditions).await
    }
}

enum EngineCommand {
    Download { request: DownloadRequest, respond: oneshot::Sender<Result<DownloadTask, KetchError>> },
    Pause { task_id: TaskId, respond: oneshot::Sender<Result<(), KetchError>> },
    Resume { task_id: TaskId, destination_override: Option<PathBuf>, respond: oneshot::Sender<Result<(), KetchError>> },
    Cancel { task_id: TaskId, respond: oneshot::Sender<Result<(), KetchError>> },
    Remove { task_id: TaskId, respond: oneshot::Sender<Result<(), KetchError>> },
    SetSpeedLimit { task_id: TaskId, limit: SpeedLimit, respond: oneshot::Sender<Result<(), KetchError>> },
    SetPriority { task_id: TaskId, priority: Priority, respond: oneshot::Sender<Result<(), KetchError>> },
    SetConnections { task_id: TaskId, connections: usize, respond: oneshot::Sender<Result<(), KetchError>> },
    Reschedule {
        task_id: TaskId,
        schedule: Schedule,
        conditions: Vec<Arc<dyn Condition>>,
        respond: oneshot::Sender<Result<(), KetchError>>,
    },
    UpdateConfig { config: KetchConfig, respond: oneshot::Sender<Result<(), KetchError>> },
    RehydrateAll { respond: oneshot::Sender<Result<(), KetchError>> },
    Close { respond: oneshot::Sender<()> },
}

struct ChannelController {
    tx: mpsc::Sender<EngineCommand>,
}

macro_rules! send_and_wait {
    ($self:expr, $variant:ident { $($field:ident : $value:expr),* $(,)? }) => {{
        let (respond, rx) = oneshot::channel();
        $self.tx.send(EngineCommand::$variant { $($field: $value,)* respond }).await.map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())?
    }};
}

#[async_trait]
impl TaskController for ChannelController {
    async fn pause(&self, task_id: TaskId) -> Result<(), KetchError> {
        send_and_wait!(self, Pause { task_id })
    }

    async fn resume(&self, task_id: TaskId, destination_override: Option<PathBuf>) -> Result<(), KetchError> {
        send_and_wait!(self, Resume { task_id, destination_override })
    }

    async fn cancel(&self, task_id: TaskId) -> Result<(), KetchError> {
        send_and_wait!(self, Cancel { task_id })
    }

    async fn remove(&self, task_id: TaskId) -> Result<(), KetchError> {
        send_and_wait!(self, Remove { task_id })
    }

    async fn set_speed_limit(&self, task_id: TaskId, limit: SpeedLimit) -> Result<(), KetchError> {
        send_and_wait!(self, SetSpeedLimit { task_id, limit })
    }

    async fn set_priority(&self, task_id: TaskId, priority: Priority) -> Result<(), KetchError> {
        send_and_wait!(self, SetPriority { task_id, priority })
    }

    async fn set_connections(&self, task_id: TaskId, connections: usize) -> Result<(), KetchError> {
        send_and_wait!(self, SetConnections { task_id, connections })
    }

    async fn reschedule(&self, task_id: TaskId, schedule: Schedule, conditions: Vec<Arc<dyn Condition>>) -> Result<(), KetchError> {
        send_and_wait!(self, Reschedule { task_id, schedule, conditions })
    }
}

struct EngineInner {
    queue: Arc<DownloadQueue>,
    scheduler: Arc<DownloadScheduler>,
    coordinator: Arc<DownloadCoordinator>,
    store: Arc<dyn TaskStore>,
    global_limiter: Arc<DelegatingSpeedLimiter>,
    tasks: StdMutex<HashMap<TaskId, TaskObservers>>,
    /// Cloned into every `DownloadTask` the command loop hands out, so
    /// handlers running inside the loop can still build a working
    /// `ChannelController` without threading `tx` through every call.
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineInner {
    fn observers_for(&self, task_id: TaskId) -> Option<TaskObservers> {
        self.tasks.lock().unwrap().get(&task_id).cloned()
    }

    fn forget(&self, task_id: TaskId) {
        self.tasks.lock().unwrap().remove(&task_id);
    }
}

/// The engine facade (§4.8). `Arc<Ketch>` is cheap to clone; every clone
/// shares the same command loop and engine state.
pub struct Ketch {
    inner: Arc<EngineInner>,
    tx: mpsc::Sender<EngineCommand>,
}

impl Ketch {
    /// Builds the default engine: curl-backed HTTP, a SQLite task store at
    /// the XDG state path, and a process-wide token bucket seeded from
    /// `config.speed_limit`.
    pub async fn new(config: KetchConfig) -> Result<Arc<Self>, KetchError> {
        let http: Arc<dyn HttpEngine> = Arc::new(CurlHttpEngine::new());
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_default().await?);
        Self::with_components(config, http, store).await
    }

    /// Same wiring as `new`, but with the HTTP transport and store supplied
    /// by the caller — the seam integration tests and `ketch-cli` use to
    /// substitute fakes/temp databases.
    pub async fn with_components(
        config: KetchConfig,
        http: Arc<dyn HttpEngine>,
        store: Arc<dyn TaskStore>,
    ) -> Result<Arc<Self>, KetchError> {
        let inner_limiter = speed_limit_to_limiter(config.speed_limit);
        let global_limiter = Arc::new(DelegatingSpeedLimiter::global(inner_limiter));

        let http_source = Arc::new(HttpDownloadSource::new(http.clone(), config.max_connections));
        let resolver = Arc::new(SourceResolver::new(vec![http_source]));
        let coordinator_config = CoordinatorConfig::from(&config);
        let coordinator = Arc::new(DownloadCoordinator::new(
            resolver,
            store.clone(),
            http,
            Arc::clone(&global_limiter) as Arc<dyn SpeedLimiter>,
            coordinator_config,
        ));
        let queue = DownloadQueue::new(Arc::clone(&coordinator), store.clone(), config.queue.clone());
        let scheduler = DownloadScheduler::new(Arc::clone(&queue), store.clone());

        let (tx, rx) = mpsc::channel(1024);
        let inner = Arc::new(EngineInner {
            queue,
            scheduler,
            coordinator,
            store,
            global_limiter,
            tasks: StdMutex::new(HashMap::new()),
            tx: tx.clone(),
        });
        spawn_command_loop(Arc::clone(&inner), rx);

        let engine = Arc::new(Self { inner, tx });
        engine.rehydrate().await?;
        Ok(engine)
    }

    fn controller(&self) -> Arc<dyn TaskController> {
        Arc::new(ChannelController { tx: self.tx.clone() })
    }

    /// `download(request)` (§4.8): persists a fresh `TaskRecord` and gates
    /// or enqueues it per the request's `schedule`/`conditions`.
    pub async fn download(&self, request: DownloadRequest) -> Result<DownloadTask, KetchError> {
        let (respond, rx) = oneshot::channel();
        self.tx.send(EngineCommand::Download { request, respond }).await.map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())?
    }

    /// Loads persisted records and rehydrates tasks per their stored state
    /// (§4.8 `start()`): `Scheduled` re-gates on the same schedule with no
    /// conditions (they aren't persisted); `Queued`/`Downloading` re-enqueue
    /// with `preferResume=true`; `Paused` stays paused; terminal states are
    /// left untouched.
    async fn rehydrate(&self) -> Result<(), KetchError> {
        let (respond, rx) = oneshot::channel();
        self.tx.send(EngineCommand::RehydrateAll { respond }).await.map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())?
    }

    /// Looks up a previously-returned task's live view again (e.g. after a
    /// process restart, via `task_id` read back from storage).
    pub fn task(&self, task_id: TaskId) -> Option<DownloadTask> {
        let observers = self.inner.observers_for(task_id)?;
        Some(DownloadTask {
            task_id,
            state: observers.state.reader(),
            segments: observers.segments.reader(),
            controller: self.controller(),
        })
    }

    /// Atomically updates the global speed limit and queue caps (§4.8).
    pub async fn update_config(&self, config: KetchConfig) -> Result<(), KetchError> {
        let (respond, rx) = oneshot::channel();
        self.tx.send(EngineCommand::UpdateConfig { config, respond }).await.map_err(|_| channel_closed())?;
        rx.await.map_err(|_| channel_closed())?
    }

    /// Stops all supervised work. The curl transport holds no persistent
    /// connections to close; this cancels every still-tracked task so no
    /// background work outlives the call.
    pub async fn close(&self) {
        let (respond, rx) = oneshot::channel();
        if self.tx.send(EngineCommand::Close { respond }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

fn speed_limit_to_limiter(speed_limit: SpeedLimit) -> Arc<dyn SpeedLimiter> {
    match speed_limit {
        SpeedLimit::Unlimited => Arc::new(Unlimited),
        SpeedLimit::BytesPerSecond(rate) => Arc::new(crate::limiter::TokenBucket::with_default_burst(rate)),
    }
}

fn spawn_command_loop(inner: Arc<EngineInner>, mut rx: mpsc::Receiver<EngineCommand>) {
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            if let EngineCommand::Close { respond } = cmd {
                handle_close(&inner).await;
                let _ = respond.send(());
                break;
            }
            handle_cmd(&inner, cmd).await;
        }
    });
}

async fn handle_cmd(inner: &Arc<EngineInner>, cmd: EngineCommand) {
    match cmd {
        EngineCommand::Download { request, respond } => {
            let result = handle_download(inner, request).await;
            let _ = respond.send(result);
        }
        EngineCommand::Pause { task_id, respond } => {
            let _ = respond.send(handle_pause(inner, task_id).await);
        }
        EngineCommand::Resume { task_id, destination_override, respond } => {
            let _ = respond.send(handle_resume(inner, task_id, destination_override).await);
        }
        EngineCommand::Cancel { task_id, respond } => {
            let _ = respond.send(handle_cancel(inner, task_id).await);
        }
        EngineCommand::Remove { task_id, respond } => {
            let _ = respond.send(handle_remove(inner, task_id).await);
        }
        EngineCommand::SetSpeedLimit { task_id, limit, respond } => {
            let _ = respond.send(handle_set_speed_limit(inner, task_id, limit).await);
        }
        EngineCommand::SetPriority { task_id, priority, respond } => {
            let _ = respond.send(handle_set_priority(inner, task_id, priority).await);
        }
        EngineCommand::SetConnections { task_id, connections, respond } => {
            let _ = respond.send(handle_set_connections(inner, task_id, connections).await);
        }
        EngineCommand::Reschedule { task_id, schedule, conditions, respond } => {
            let _ = respond.send(handle_reschedule(inner, task_id, schedule, conditions).await);
        }
        EngineCommand::UpdateConfig { config, respond } => {
            let _ = respond.send(handle_update_config(inner, config).await);
        }
        EngineCommand::RehydrateAll { respond } => {
            let _ = respond.send(handle_rehydrate_all(inner).await);
        }
        EngineCommand::Close { .. } => unreachable!("Close is handled before dispatch"),
    }
}

async fn handle_download(inner: &Arc<EngineInner>, request: DownloadRequest) -> Result<DownloadTask, KetchError> {
    let task_id = TaskId::new();
    let now = unix_timestamp();
    let schedule = request.schedule.clone();
    let conditions = request.conditions.clone();
    let record = TaskRecord {
        task_id,
        request: DownloadRequestRecord::from(&request),
        state: if request.is_gated() { TaskState::Scheduled } else { TaskState::Queued },
        created_at: now,
        updated_at: now,
        total_bytes: -1,
        downloaded_bytes: 0,
        output_path: None,
        segments: None,
        source_resume_state: None,
        error_message: None,
    };

    let observers = TaskObservers::new();
    inner.tasks.lock().unwrap().insert(task_id, observers.clone());

    inner.scheduler.schedule(record, observers.clone(), schedule, conditions).await?;

    Ok(DownloadTask {
        task_id,
        state: observers.state.reader(),
        segments: observers.segments.reader(),
        controller: Arc::new(ChannelController { tx: inner.tx.clone() }),
    })
}

/// Pulls the task out of whatever holds it (active/queued, via the queue)
/// and re-admits it with `preferResume=true`, threading the destination
/// override through to wherever it's actually started (§4.8
/// `resume(destinationOverride?)`).
async fn handle_resume(inner: &Arc<EngineInner>, task_id: TaskId, destination_override: Option<PathBuf>) -> Result<(), KetchError> {
    let observers = inner
        .observers_for(task_id)
        .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?;
    let record = inner
        .store
        .load(&task_id)
        .await?
        .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?;
    inner.queue.enqueue_with_destination(record, observers, true, destination_override).await
}

/// Withdraws the task from the queue (pausing it first if active) and
/// persists `Paused`, so the queue's active/host bookkeeping always
/// reflects a user-initiated pause the same way it does a preemption
/// (§4.6, §4.8 `pause`).
async fn handle_pause(inner: &Arc<EngineInner>, task_id: TaskId) -> Result<(), KetchError> {
    let observers = inner
        .observers_for(task_id)
        .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?;
    let Some((mut record, _)) = inner.queue.withdraw(task_id).await? else {
        return Err(KetchError::Unsupported(format!("task {task_id} is not active or queued")));
    };
    record.state = TaskState::Paused;
    record.updated_at = unix_timestamp();
    inner.store.save(&record).await?;
    observers.state.set(DownloadState::Paused(Default::default()));
    Ok(())
}

/// Cancellation can catch a task at any stage (§4.7): still gated in the
/// scheduler, sitting in the queue, or actively downloading. Exactly one
/// of the two branches below owns a given task at a time.
async fn handle_cancel(inner: &Arc<EngineInner>, task_id: TaskId) -> Result<(), KetchError> {
    let observers = inner
        .observers_for(task_id)
        .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?;
    if inner.scheduler.cancel(task_id, &observers).await? {
        return Ok(());
    }
    inner.queue.dequeue(task_id).await
}

async fn handle_remove(inner: &Arc<EngineInner>, task_id: TaskId) -> Result<(), KetchError> {
    handle_cancel(inner, task_id).await?;
    inner.store.remove(&task_id).await?;
    inner.forget(task_id);
    Ok(())
}

async fn handle_set_speed_limit(inner: &Arc<EngineInner>, task_id: TaskId, limit: SpeedLimit) -> Result<(), KetchError> {
    inner.coordinator.set_task_speed_limit(task_id, limit).await
}

async fn handle_set_priority(inner: &Arc<EngineInner>, task_id: TaskId, priority: Priority) -> Result<(), KetchError> {
    inner.queue.set_priority(task_id, priority).await
}

async fn handle_set_connections(inner: &Arc<EngineInner>, task_id: TaskId, connections: usize) -> Result<(), KetchError> {
    let connections = connections.max(1);
    if let Ok(()) = inner.coordinator.set_task_connections(task_id, connections).await {
        return Ok(());
    }
    // Not active: just update the persisted request so the next start
    // picks up the new connection count (§8 Open Questions: setConnections
    // on an inactive task is a plain record update, not a no-op error).
    if let Some(mut record) = inner.store.load(&task_id).await? {
        record.request.connections = connections;
        record.updated_at = unix_timestamp();
        inner.store.save(&record).await?;
        return Ok(());
    }
    Err(KetchError::Unsupported(format!("no such task {task_id}")))
}

async fn handle_reschedule(
    inner: &Arc<EngineInner>,
    task_id: TaskId,
    schedule: Schedule,
    conditions: Vec<Arc<dyn Condition>>,
) -> Result<(), KetchError> {
    let observers = inner
        .observers_for(task_id)
        .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?;
    inner.scheduler.reschedule(task_id, observers, schedule, conditions).await
}

async fn handle_update_config(inner: &Arc<EngineInner>, config: KetchConfig) -> Result<(), KetchError> {
    match config.speed_limit {
        SpeedLimit::Unlimited => inner.global_limiter.set_inner(Arc::new(Unlimited)).await,
        SpeedLimit::BytesPerSecond(rate) => {
            if !inner.global_limiter.try_update_rate(rate).await {
                inner.global_limiter.set_inner(Arc::new(crate::limiter::TokenBucket::with_default_burst(rate))).await;
            }
        }
    }
    inner.queue.set_config(config.queue);
    Ok(())
}

/// `start()` (§4.8): reload every persisted record and resume supervising
/// it according to its stored state.
async fn handle_rehydrate_all(inner: &Arc<EngineInner>) -> Result<(), KetchError> {
    let records = inner.store.load_all().await?;
    for record in records {
        let task_id = record.task_id;
        if record.state.is_terminal() {
            continue;
        }

        let observers = TaskObservers::new();
        let initial_state = match record.state {
            TaskState::Paused => DownloadState::Paused(Default::default()),
            _ => DownloadState::Idle,
        };
        observers.state.set(initial_state);
        inner.tasks.lock().unwrap().insert(task_id, observers.clone());

        match record.state {
            TaskState::Scheduled => {
                let schedule = record.request.schedule.clone();
                if let Err(e) = inner.scheduler.schedule(record, observers, schedule, Vec::new()).await {
                    error!(task = %task_id, error = %e, "failed to re-gate scheduled task on startup");
                }
            }
            TaskState::Queued | TaskState::Downloading => {
                if let Err(e) = inner.queue.enqueue(record, observers, true).await {
                    error!(task = %task_id, error = %e, "failed to re-enqueue task on startup");
                }
            }
            TaskState::Paused => {}
            TaskState::Completed | TaskState::Failed | TaskState::Canceled => unreachable!("filtered above"),
        }
    }
    Ok(())
}

async fn handle_close(inner: &Arc<EngineInner>) {
    let task_ids: Vec<TaskId> = inner.tasks.lock().unwrap().keys().copied().collect();
    for task_id in task_ids {
        if let Err(e) = inner.queue.dequeue(task_id).await {
            warn!(task = %task_id, error = %e, "failed to stop task during close");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use crate::http::{ByteRange, CancelSignal, ChunkSink, HttpEngine};
    use crate::model::request::Destination;
    use crate::model::ServerInfo;
    use crate::store::SqliteTaskStore;

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

    async fn build_engine(body: Vec<u8>) -> Arc<Ketch> {
        let http: Arc<dyn HttpEngine> = Arc::new(StubHttpEngine { body });
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_path("sqlite::memory:").await.unwrap());
        let mut config = KetchConfig::default();
        config.max_connections = 1;
        Ketch::with_components(config, http, store).await.unwrap()
    }

    async fn wait_for(reader: &mut CellReader<DownloadState>, pred: impl Fn(&DownloadState) -> bool) -> DownloadState {
        if pred(&reader.get()) {
            return reader.get();
        }
        loop {
            match reader.changed().await {
                Some(s) if pred(&s) => return s,
                Some(_) => continue,
                None => panic!("state channel closed before reaching expected state"),
            }
        }
    }

    #[tokio::test]
    async fn download_runs_to_completion() {
        let engine = build_engine(b"hello world".to_vec()).await;
        let req = DownloadRequest::new("https://a.example.com/f", Destination::Directory(std::env::temp_dir()));
        let task = engine.download(req).await.unwrap();

        let mut reader = task.watch_state();
        let state = tokio::time::timeout(Duration::from_secs(5), wait_for(&mut reader, |s| s.is_terminal()))
            .await
            .expect("download should finish within the timeout");
        assert!(matches!(state, DownloadState::Completed(_)), "expected Completed, got {state:?}");
    }

    #[tokio::test]
    async fn pause_then_resume_continues_through_the_same_handle() {
        let engine = build_engine(b"some bytes to copy around".to_vec()).await;
        let req = DownloadRequest::new("https://a.example.com/f", Destination::Directory(std::env::temp_dir()));
        let task = engine.download(req).await.unwrap();

        task.pause().await.unwrap();
        let mut reader = task.watch_state();
        let paused = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for(&mut reader, |s| matches!(s, DownloadState::Paused(_))),
        )
        .await
        .expect("task should reach Paused");
        assert!(matches!(paused, DownloadState::Paused(_)));

        task.resume(None).await.unwrap();
        let state = tokio::time::timeout(Duration::from_secs(5), wait_for(&mut reader, |s| s.is_terminal()))
            .await
            .expect("resumed download should finish");
        assert!(matches!(state, DownloadState::Completed(_)));
    }

    #[tokio::test]
    async fn cancel_of_a_gated_task_transitions_to_canceled() {
        let engine = build_engine(b"irrelevant".to_vec()).await;
        let mut req = DownloadRequest::new("https://a.example.com/f", Destination::Directory(std::env::temp_dir()));
        req.schedule = Schedule::AfterDelay(Duration::from_secs(60));
        let task = engine.download(req).await.unwrap();

        task.cancel().await.unwrap();
        let mut reader = task.watch_state();
        let state = tokio::time::timeout(Duration::from_secs(5), wait_for(&mut reader, |s| s.is_terminal()))
            .await
            .expect("cancel should finish promptly instead of waiting out the delay");
        assert!(matches!(state, DownloadState::Canceled));
    }

    #[tokio::test]
    async fn update_config_swaps_the_global_speed_limit() {
        let engine = build_engine(b"data".to_vec()).await;
        let mut config = KetchConfig::default();
        config.speed_limit = SpeedLimit::BytesPerSecond(1024);
        engine.update_config(config).await.unwrap();

        let mut config = KetchConfig::default();
        config.speed_limit = SpeedLimit::Unlimited;
        engine.update_config(config).await.unwrap();
    }

    #[tokio::test]
    async fn close_stops_supervised_work_without_erroring() {
        let engine = build_engine(b"data".to_vec()).await;
        let mut req = DownloadRequest::new("https://a.example.com/f", Destination::Directory(std::env::temp_dir()));
        req.schedule = Schedule::AfterDelay(Duration::from_secs(60));
        let _task = engine.download(req).await.unwrap();

        engine.close().await;
    }
}
