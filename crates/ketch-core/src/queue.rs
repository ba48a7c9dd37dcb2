//! `DownloadQueue` (§4.6): admission control in front of the coordinator —
//! priority ordering, URGENT preemption, and per-host connection caps.
//!
//! Claims up to a concurrency cap and promotes the next queued task when
//! one finishes; an URGENT arrival with no free slot preempts the lowest-
//! priority active task sharing its host instead of waiting behind it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::coordinator::{DownloadCoordinator, TaskObservers};
use crate::error::KetchError;
use crate::host::extract_host;
use crate::model::request::Priority;
use crate::model::{DownloadState, TaskId, TaskRecord, TaskState};
use crate::observable::CellReader;
use crate::store::TaskStore;

fn unix_timestamp() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// A task waiting for admission, still carrying everything needed to start
/// or requeue it.
struct QueuedEntry {
    task_id: TaskId,
    host: String,
    priority: Priority,
    created_at: i64,
    record: TaskRecord,
    observers: TaskObservers,
    prefer_resume: bool,
    destination_override: Option<PathBuf>,
}

/// Bookkeeping for one executing task (§4.6 `taskHost`). `observers` is kept
/// so a preempted task can be handed back to `queued` with the same
/// observable cells its subscribers already hold.
struct ActiveEntry {
    host: String,
    priority: Priority,
    started_at: i64,
    observers: TaskObservers,
    prefer_resume: bool,
}

struct QueueState {
    active: HashMap<TaskId, ActiveEntry>,
    queued: Vec<QueuedEntry>,
    host_count: HashMap<String, usize>,
}

impl QueueState {
    fn new() -> Self {
        Self { active: HashMap::new(), queued: Vec::new(), host_count: HashMap::new() }
    }

    /// `(priority DESC, createdAt ASC)` — URGENT first, FIFO within a tier.
    fn resort(&mut self) {
        self.queued.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));
    }
}

enum Admission {
    StartDirect,
    Preempt(TaskId),
    Queue,
}

/// Whether admitting `priority`/`host` right now needs to wait, can start
/// immediately, or should preempt an active task. Pure function of the
/// current state so it's unit-testable without spinning up a coordinator.
fn decide_admission(state: &QueueState, cfg: &QueueConfig, host: &str, priority: Priority) -> Admission {
    let active_full = state.active.len() >= cfg.max_concurrent_downloads;
    let host_full = state.host_count.get(host).copied().unwrap_or(0) >= cfg.max_connections_per_host;
    if !active_full && !host_full {
        return Admission::StartDirect;
    }
    if priority == Priority::Urgent {
        // A victim must be strictly lower priority, and if the block was
        // specifically the host cap, it must share the host (otherwise
        // freeing it wouldn't relieve the constraint that's actually full).
        let mut candidates: Vec<(TaskId, Priority, i64)> = state
            .active
            .iter()
            .filter(|(_, a)| a.priority < priority)
            .filter(|(_, a)| !host_full || a.host == host)
            .map(|(id, a)| (*id, a.priority, a.started_at))
            .collect();
        // Lowest priority first; largest arrival time (most recent) breaks ties.
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)));
        if let Some((victim_id, ..)) = candidates.into_iter().next() {
            return Admission::Preempt(victim_id);
        }
    }
    Admission::Queue
}

/// Admission control in front of the `DownloadCoordinator` (§4.6). All
/// mutable state lives behind one mutex, held only for the O(queue length)
/// work of looking up/inserting/sorting entries — never across an `await`.
pub struct DownloadQueue {
    coordinator: Arc<DownloadCoordinator>,
    store: Arc<dyn TaskStore>,
    config: StdMutex<QueueConfig>,
    state: StdMutex<QueueState>,
}

impl DownloadQueue {
    pub fn new(coordinator: Arc<DownloadCoordinator>, store: Arc<dyn TaskStore>, config: QueueConfig) -> Arc<Self> {
        Arc::new(Self { coordinator, store, config: StdMutex::new(config), state: StdMutex::new(QueueState::new()) })
    }

    /// Applied to the next `enqueue`/`promoteNext`; in-flight tasks are
    /// unaffected until their next admission decision.
    pub fn set_config(&self, config: QueueConfig) {
        *self.config.lock().unwrap() = config;
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.state.lock().unwrap().queued.len()
    }

    /// Admits `record` (§4.6 `enqueue`). `prefer_resume` is the scheduler's
    /// hint that, combined with the record already carrying partial
    /// progress, means the coordinator should be asked to `resume` rather
    /// than `start`.
    pub async fn enqueue(self: &Arc<Self>, record: TaskRecord, observers: TaskObservers, prefer_resume: bool) -> Result<(), KetchError> {
        self.enqueue_with_destination(record, observers, prefer_resume, None).await
    }

    /// Same admission path as `enqueue`, with an optional output-path
    /// override (§4.8 `resume(destinationOverride?)`) carried through to
    /// `start_task` for whenever the record is actually started.
    pub async fn enqueue_with_destination(
        self: &Arc<Self>,
        mut record: TaskRecord,
        observers: TaskObservers,
        prefer_resume: bool,
        destination_override: Option<PathBuf>,
    ) -> Result<(), KetchError> {
        let host = extract_host(&record.request.url).map_err(|e| KetchError::Unsupported(e.to_string()))?;
        let priority = record.request.priority;
        let auto_start = self.config.lock().unwrap().auto_start;

        if !auto_start {
            let task_id = record.task_id;
            let created_at = record.created_at;
            record.state = TaskState::Queued;
            record.updated_at = unix_timestamp();
            self.store.save(&record).await?;
            observers.state.set(DownloadState::Queued);

            let mut state = self.state.lock().unwrap();
            state.queued.push(QueuedEntry {
                task_id,
                host,
                priority,
                created_at,
                record,
                observers,
                prefer_resume,
                destination_override,
            });
            state.resort();
            return Ok(());
        }

        self.admit_or_queue(record, observers, host, priority, prefer_resume, destination_override).await
    }

    /// `dequeue(id)` (§4.6): drops a still-queued task outright (it never
    /// started, so there's nothing for the coordinator to clean up beyond
    /// what `cancel` already does for an active one); an active task is
    /// delegated to `coordinator.cancel`.
    pub async fn dequeue(self: &Arc<Self>, task_id: TaskId) -> Result<(), KetchError> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            let idx = state.queued.iter().position(|e| e.task_id == task_id);
            idx.map(|i| state.queued.remove(i))
        };
        if let Some(entry) = removed {
            self.store.remove(&task_id).await?;
            entry.observers.state.set(DownloadState::Canceled);
            return Ok(());
        }
        self.coordinator.cancel(task_id).await
    }

    /// Pulls a task out of the queue entirely — pausing it first if it's
    /// active — and hands back its record/observers so a caller (the
    /// scheduler's `reschedule`, §4.7) can re-gate it. `None` if the queue
    /// has no record of the task (already terminal, or never reached it).
    pub async fn withdraw(self: &Arc<Self>, task_id: TaskId) -> Result<Option<(TaskRecord, TaskObservers)>, KetchError> {
        let from_queue = {
            let mut state = self.state.lock().unwrap();
            state.queued.iter().position(|e| e.task_id == task_id).map(|i| state.queued.remove(i))
        };
        if let Some(entry) = from_queue {
            return Ok(Some((entry.record, entry.observers)));
        }

        let still_active = self.state.lock().unwrap().active.contains_key(&task_id);
        if !still_active {
            return Ok(None);
        }

        self.coordinator.pause(task_id).await?;
        let active = {
            let mut state = self.state.lock().unwrap();
            state.active.remove(&task_id).map(|active| {
                if let Some(count) = state.host_count.get_mut(&active.host) {
                    *count = count.saturating_sub(1);
                    if *count == 0 {
                        state.host_count.remove(&active.host);
                    }
                }
                active
            })
        };
        let Some(active) = active else { return Ok(None) };
        let record = self
            .store
            .load(&task_id)
            .await?
            .ok_or_else(|| KetchError::Unsupported(format!("withdrawn task {task_id} missing from store")))?;
        Ok(Some((record, active.observers)))
    }

    /// `setPriority(id, p)` (§4.6): mutate in place, re-sort, and re-evaluate
    /// admission — a queued task promoted to URGENT goes through the same
    /// preemption path a brand-new URGENT enqueue would.
    pub async fn set_priority(self: &Arc<Self>, task_id: TaskId, priority: Priority) -> Result<(), KetchError> {
        let queued_entry = {
            let mut state = self.state.lock().unwrap();
            if let Some(active) = state.active.get_mut(&task_id) {
                active.priority = priority;
                state.resort();
                None
            } else if let Some(idx) = state.queued.iter().position(|e| e.task_id == task_id) {
                let mut entry = state.queued.remove(idx);
                entry.priority = priority;
                entry.record.request.priority = priority;
                Some(entry)
            } else {
                return Err(KetchError::Unsupported(format!("no such task {task_id}")));
            }
        };

        match queued_entry {
            Some(entry) => {
                self.admit_or_queue(entry.record, entry.observers, entry.host, priority, entry.prefer_resume, entry.destination_override)
                    .await
            }
            None => {
                self.promote_next().await;
                Ok(())
            }
        }
    }

    async fn admit_or_queue(
        self: &Arc<Self>,
        mut record: TaskRecord,
        observers: TaskObservers,
        host: String,
        priority: Priority,
        prefer_resume: bool,
        destination_override: Option<PathBuf>,
    ) -> Result<(), KetchError> {
        let task_id = record.task_id;
        let created_at = record.created_at;
        let decision = {
            let cfg = self.config.lock().unwrap().clone();
            let state = self.state.lock().unwrap();
            decide_admission(&state, &cfg, &host, priority)
        };

        match decision {
            Admission::StartDirect => {
                self.start_task(record, observers, host, priority, prefer_resume, destination_override).await;
                self.promote_next().await;
            }
            Admission::Preempt(victim_id) => {
                info!(task = %task_id, victim = %victim_id, "preempting lower-priority task for URGENT admission");
                self.requeue_victim(victim_id).await?;
                self.start_task(record, observers, host, priority, prefer_resume, destination_override).await;
                self.promote_next().await;
            }
            Admission::Queue => {
                record.state = TaskState::Queued;
                record.updated_at = unix_timestamp();
                self.store.save(&record).await?;
                observers.state.set(DownloadState::Queued);

                let mut state = self.state.lock().unwrap();
                state.queued.push(QueuedEntry {
                    task_id,
                    host,
                    priority,
                    created_at,
                    record,
                    observers,
                    prefer_resume,
                    destination_override,
                });
                state.resort();
            }
        }
        Ok(())
    }

    /// Pauses an active task chosen as a preemption victim and hands it
    /// back to `queued` with `prefer_resume: true`, reusing its original
    /// observers so its subscribers see `Downloading -> Paused -> Queued`
    /// rather than losing the task entirely.
    async fn requeue_victim(self: &Arc<Self>, victim_id: TaskId) -> Result<(), KetchError> {
        self.coordinator.pause(victim_id).await?;

        let active = {
            let mut state = self.state.lock().unwrap();
            match state.active.remove(&victim_id) {
                Some(active) => {
                    if let Some(count) = state.host_count.get_mut(&active.host) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            state.host_count.remove(&active.host);
                        }
                    }
                    active
                }
                None => {
                    warn!(task = %victim_id, "preemption victim no longer active; skipping requeue");
                    return Ok(());
                }
            }
        };

        let record = self
            .store
            .load(&victim_id)
            .await?
            .ok_or_else(|| KetchError::Unsupported(format!("preempted task {victim_id} missing from store")))?;
        let created_at = record.created_at;

        let mut state = self.state.lock().unwrap();
        state.queued.push(QueuedEntry {
            task_id: victim_id,
            host: active.host,
            priority: active.priority,
            created_at,
            record,
            observers: active.observers,
            prefer_resume: true,
            destination_override: None,
        });
        state.resort();
        Ok(())
    }

    /// Repeatedly starts the first queued entry whose host still has
    /// headroom, until the active cap is reached or none remain (§4.6
    /// `promoteNext`).
    async fn promote_next(self: &Arc<Self>) {
        loop {
            let next = {
                let cfg = self.config.lock().unwrap().clone();
                let mut state = self.state.lock().unwrap();
                if state.active.len() >= cfg.max_concurrent_downloads {
                    None
                } else {
                    let idx = state
                        .queued
                        .iter()
                        .position(|e| state.host_count.get(&e.host).copied().unwrap_or(0) < cfg.max_connections_per_host);
                    idx.map(|i| state.queued.remove(i))
                }
            };
            let Some(entry) = next else { break };
            self.start_task(entry.record, entry.observers, entry.host, entry.priority, entry.prefer_resume, entry.destination_override)
                .await;
        }
    }

    /// Reserves the active/host slot, then calls into the coordinator.
    /// `resume` is used over `start` when the caller asked for it and the
    /// record actually carries partial progress to resume from.
    async fn start_task(
        self: &Arc<Self>,
        record: TaskRecord,
        observers: TaskObservers,
        host: String,
        priority: Priority,
        prefer_resume: bool,
        destination_override: Option<PathBuf>,
    ) {
        let task_id = record.task_id;
        let started_at = unix_timestamp();
        {
            let mut state = self.state.lock().unwrap();
            state.active.insert(
                task_id,
                ActiveEntry { host: host.clone(), priority, started_at, observers: observers.clone(), prefer_resume },
            );
            *state.host_count.entry(host).or_insert(0) += 1;
        }

        let resume = prefer_resume && record.segments.is_some() && record.source_resume_state.is_some();
        // Subscribe before calling start/resume: a fast-completing stub
        // engine can reach a terminal state before this function returns,
        // and a reader created afterwards would miss it.
        let state_reader = observers.state.reader();
        let result = if resume {
            self.coordinator.resume(record, observers.clone(), destination_override).await
        } else {
            self.coordinator.start(record, observers.clone()).await
        };

        match result {
            Ok(()) => self.spawn_terminal_watcher(task_id, state_reader),
            Err(error) => {
                warn!(task = %task_id, error = %error, "task failed before it could start");
                self.finish_slot(&task_id);
                self.persist_start_failure(task_id, &observers, error).await;
            }
        }
    }

    fn finish_slot(&self, task_id: &TaskId) {
        let mut state = self.state.lock().unwrap();
        if let Some(active) = state.active.remove(task_id) {
            if let Some(count) = state.host_count.get_mut(&active.host) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    state.host_count.remove(&active.host);
                }
            }
        }
    }

    async fn persist_start_failure(&self, task_id: TaskId, observers: &TaskObservers, error: KetchError) {
        let message = error.to_string();
        observers.state.set(DownloadState::Failed(Arc::new(error)));
        match self.store.load(&task_id).await {
            Ok(Some(mut record)) => {
                record.state = TaskState::Failed;
                record.error_message = Some(message);
                record.updated_at = unix_timestamp();
                if let Err(e) = self.store.save(&record).await {
                    warn!(task = %task_id, error = %e, "failed to persist start failure");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(task = %task_id, error = %e, "failed to reload task after start failure"),
        }
    }

    /// Watches a started task's state cell for a terminal value, then frees
    /// its slot and promotes the next queued task (§4.6
    /// `onTaskCompleted/Failed/Canceled`).
    fn spawn_terminal_watcher(self: &Arc<Self>, task_id: TaskId, mut reader: CellReader<DownloadState>) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match reader.changed().await {
                    Some(state) if state.is_terminal() => {
                        debug!(task = %task_id, state = ?state, "task reached terminal state");
                        queue.finish_slot(&task_id);
                        queue.promote_next().await;
                        break;
                    }
                    Some(_) => continue,
                    None => break,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::config::KetchConfig;
    use crate::coordinator::CoordinatorConfig;
    use crate::http::{ByteRange, CancelSignal, ChunkSink, HttpEngine};
    use crate::limiter::Unlimited;
    use crate::model::request::{Destination, DownloadRequest};
    use crate::model::{DownloadRequestRecord, ServerInfo};
    use crate::source::{HttpDownloadSource, SourceResolver};
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

    /// Never completes on its own; loops checking cancellation until
    /// `release` is notified or `pause`/`cancel` flips the signal.
    struct GatedHttpEngine {
        release: Arc<tokio::sync::Notify>,
        started: Arc<AtomicBool>,
    }

    #[async_trait]
    impl HttpEngine for GatedHttpEngine {
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

    /// An `HttpEngine` whose `download` blocks per-URL until explicitly
    /// released, then delivers a zero-filled body of exactly the requested
    /// range's length. Unlike `GatedHttpEngine` (which only ever exits via
    /// cancellation), this lets a test drive one specific task to a normal
    /// `Completed` state while others stay active — needed to reproduce
    /// "on completion of task X, task Y is promoted" scenarios.
    struct KeyedGateEngine {
        content_length: i64,
        released: StdMutex<HashSet<String>>,
        started: StdMutex<HashSet<String>>,
    }

    impl KeyedGateEngine {
        fn new(content_length: i64) -> Self {
            Self { content_length, released: StdMutex::new(HashSet::new()), started: StdMutex::new(HashSet::new()) }
        }

        fn release(&self, url: &str) {
            self.released.lock().unwrap().insert(url.to_string());
        }

        async fn wait_until_started(&self, url: &str) {
            for _ in 0..200 {
                if self.started.lock().unwrap().contains(url) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("task for {url} never started");
        }
    }

    #[async_trait]
    impl HttpEngine for KeyedGateEngine {
        async fn head(&self, _url: &str, _headers: &BTreeMap<String, String>) -> Result<ServerInfo, KetchError> {
            Ok(ServerInfo {
                content_length: Some(self.content_length),
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
            url: &str,
            range: Option<ByteRange>,
            _headers: &BTreeMap<String, String>,
            mut sink: ChunkSink,
            cancel: CancelSignal,
        ) -> Result<(), KetchError> {
            self.started.lock().unwrap().insert(url.to_string());
            loop {
                if cancel.is_canceled() {
                    return Err(KetchError::Canceled);
                }
                if self.released.lock().unwrap().contains(url) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let len = match range {
                Some(r) => (r.end - r.start + 1) as usize,
                None => self.content_length as usize,
            };
            sink(&vec![0u8; len])
        }
    }

    fn sample_request(url: &str) -> DownloadRequest {
        let mut req = DownloadRequest::new(url, Destination::Directory(std::env::temp_dir()));
        req.connections = 1;
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

    async fn build_queue(http: Arc<dyn HttpEngine>, config: QueueConfig) -> (Arc<DownloadQueue>, Arc<dyn TaskStore>) {
        let http_source = Arc::new(HttpDownloadSource::new(http.clone(), 4));
        let resolver = Arc::new(SourceResolver::new(vec![http_source]));
        let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::open_path("sqlite::memory:").await.unwrap());
        let coordinator_config = CoordinatorConfig::from(&KetchConfig::default());
        let coordinator =
            Arc::new(DownloadCoordinator::new(resolver, store.clone(), http, Arc::new(Unlimited), coordinator_config));
        let queue = DownloadQueue::new(coordinator, store.clone(), config);
        (queue, store)
    }

    async fn wait_for_started(started: &AtomicBool) {
        for _ in 0..200 {
            if started.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task never started");
    }

    #[tokio::test]
    async fn enqueue_starts_immediately_under_capacity() {
        let body = b"hello".to_vec();
        let http: Arc<dyn HttpEngine> = Arc::new(StubHttpEngine { body: body.clone() });
        let cfg = QueueConfig { max_concurrent_downloads: 2, max_connections_per_host: 2, auto_start: true };
        let (queue, store) = build_queue(http, cfg).await;

        let req = sample_request("https://a.example.com/f");
        let record = sample_record(&req);
        let task_id = record.task_id;
        let observers = TaskObservers::new();
        let mut reader = observers.state.reader();

        queue.enqueue(record, observers, false).await.unwrap();

        loop {
            match reader.changed().await {
                Some(DownloadState::Completed(_)) => break,
                Some(_) => continue,
                None => panic!("state channel closed before completion"),
            }
        }

        let stored = store.load(&task_id).await.unwrap().expect("record persisted");
        assert_eq!(stored.state, TaskState::Completed);
        std::fs::remove_file(std::path::PathBuf::from(stored.output_path.unwrap())).ok();
    }

    #[tokio::test]
    async fn second_task_queues_when_at_capacity() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> = Arc::new(GatedHttpEngine { release: release.clone(), started: started.clone() });
        let cfg = QueueConfig { max_concurrent_downloads: 1, max_connections_per_host: 4, auto_start: true };
        let (queue, _store) = build_queue(http, cfg).await;

        let first = sample_record(&sample_request("https://a.example.com/f"));
        queue.enqueue(first, TaskObservers::new(), false).await.unwrap();
        wait_for_started(&started).await;
        assert_eq!(queue.active_count(), 1);

        let second_req = sample_request("https://b.example.com/f");
        let second = sample_record(&second_req);
        let second_observers = TaskObservers::new();
        let mut second_reader = second_observers.state.reader();
        queue.enqueue(second, second_observers, false).await.unwrap();

        assert_eq!(queue.queued_count(), 1);
        assert_eq!(second_reader.get(), DownloadState::Queued);

        release.notify_waiters();
    }

    #[tokio::test]
    async fn promote_next_starts_queued_task_once_slot_frees() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> = Arc::new(GatedHttpEngine { release: release.clone(), started: started.clone() });
        let cfg = QueueConfig { max_concurrent_downloads: 1, max_connections_per_host: 4, auto_start: true };
        let (queue, _store) = build_queue(http, cfg).await;

        let first_req = sample_request("https://a.example.com/f");
        let first = sample_record(&first_req);
        let first_task_id = first.task_id;
        queue.enqueue(first, TaskObservers::new(), false).await.unwrap();
        wait_for_started(&started).await;

        let second_req = sample_request("https://b.example.com/f");
        let second = sample_record(&second_req);
        let second_observers = TaskObservers::new();
        let mut second_reader = second_observers.state.reader();
        queue.enqueue(second, second_observers, false).await.unwrap();
        assert_eq!(queue.queued_count(), 1);

        queue.dequeue(first_task_id).await.unwrap();

        loop {
            match second_reader.changed().await {
                Some(DownloadState::Downloading(_)) => break,
                Some(DownloadState::Completed(_)) => break,
                Some(_) => continue,
                None => panic!("second task's state channel closed before it started"),
            }
        }
        assert_eq!(queue.queued_count(), 0);
        release.notify_waiters();
    }

    #[tokio::test]
    async fn urgent_preempts_lower_priority_active_task() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> = Arc::new(GatedHttpEngine { release: release.clone(), started: started.clone() });
        let cfg = QueueConfig { max_concurrent_downloads: 1, max_connections_per_host: 4, auto_start: true };
        let (queue, store) = build_queue(http, cfg).await;

        let mut normal_req = sample_request("https://a.example.com/f");
        normal_req.priority = Priority::Normal;
        let normal_record = sample_record(&normal_req);
        let normal_task_id = normal_record.task_id;
        let normal_observers = TaskObservers::new();
        let mut normal_reader = normal_observers.state.reader();
        queue.enqueue(normal_record, normal_observers, false).await.unwrap();
        wait_for_started(&started).await;

        let mut urgent_req = sample_request("https://a.example.com/g");
        urgent_req.priority = Priority::Urgent;
        let urgent_record = sample_record(&urgent_req);
        let urgent_observers = TaskObservers::new();
        queue.enqueue(urgent_record, urgent_observers, false).await.unwrap();

        loop {
            match normal_reader.changed().await {
                Some(DownloadState::Paused(_)) => break,
                Some(_) => continue,
                None => panic!("preempted task's state channel closed before pausing"),
            }
        }

        let stored = store.load(&normal_task_id).await.unwrap().expect("record persisted");
        assert_eq!(stored.state, TaskState::Paused);
        assert_eq!(queue.active_count(), 1);
    }

    #[tokio::test]
    async fn dequeue_removes_queued_task_without_starting_it() {
        let release = Arc::new(tokio::sync::Notify::new());
        let started = Arc::new(AtomicBool::new(false));
        let http: Arc<dyn HttpEngine> = Arc::new(GatedHttpEngine { release, started: started.clone() });
        let cfg = QueueConfig { max_concurrent_downloads: 1, max_connections_per_host: 4, auto_start: true };
        let (queue, store) = build_queue(http, cfg).await;

        let first = sample_record(&sample_request("https://a.example.com/f"));
        queue.enqueue(first, TaskObservers::new(), false).await.unwrap();
        wait_for_started(&started).await;

        let second_req = sample_request("https://b.example.com/f");
        let second = sample_record(&second_req);
        let second_task_id = second.task_id;
        queue.enqueue(second, TaskObservers::new(), false).await.unwrap();
        assert_eq!(queue.queued_count(), 1);

        queue.dequeue(second_task_id).await.unwrap();
        assert_eq!(queue.queued_count(), 0);
        assert!(store.load(&second_task_id).await.unwrap().is_none());
    }

    /// Host distribution `[x, x, y, x]` with `maxConcurrentDownloads=4,
    /// maxConnectionsPerHost=1`: the first `x` and the `y` task admit
    /// directly (different hosts, no contention), but the second and third
    /// `x` tasks both queue behind the per-host cap even though the overall
    /// concurrency cap still has headroom.
    #[test]
    fn per_host_cap_queues_extra_tasks_on_a_saturated_host() {
        let cfg = QueueConfig { max_concurrent_downloads: 4, max_connections_per_host: 1, auto_start: true };
        let mut state = QueueState::new();

        assert!(matches!(decide_admission(&state, &cfg, "x", Priority::Normal), Admission::StartDirect));
        state.host_count.insert("x".to_string(), 1);
        state.active.insert(
            TaskId::new(),
            ActiveEntry { host: "x".to_string(), priority: Priority::Normal, started_at: 0, observers: TaskObservers::new(), prefer_resume: false },
        );

        assert!(matches!(decide_admission(&state, &cfg, "y", Priority::Normal), Admission::StartDirect));
        state.host_count.insert("y".to_string(), 1);
        state.active.insert(
            TaskId::new(),
            ActiveEntry { host: "y".to_string(), priority: Priority::Normal, started_at: 1, observers: TaskObservers::new(), prefer_resume: false },
        );

        assert!(matches!(decide_admission(&state, &cfg, "x", Priority::Normal), Admission::Queue));
        assert!(matches!(decide_admission(&state, &cfg, "x", Priority::Normal), Admission::Queue));
    }

    #[tokio::test]
    async fn per_host_cap_promotes_next_same_host_task_on_completion() {
        let engine = Arc::new(KeyedGateEngine::new(8));
        let http: Arc<dyn HttpEngine> = engine.clone();
        let cfg = QueueConfig { max_concurrent_downloads: 4, max_connections_per_host: 1, auto_start: true };
        let (queue, store) = build_queue(http, cfg).await;

        // Host distribution [x, x, y, x].
        let x1 = sample_record(&sample_request("https://x.example.com/1"));
        let x1_task_id = x1.task_id;
        queue.enqueue(x1, TaskObservers::new(), false).await.unwrap();
        engine.wait_until_started("https://x.example.com/1").await;

        let y1 = sample_record(&sample_request("https://y.example.com/1"));
        queue.enqueue(y1, TaskObservers::new(), false).await.unwrap();
        engine.wait_until_started("https://y.example.com/1").await;

        let x2 = sample_record(&sample_request("https://x.example.com/2"));
        let x2_observers = TaskObservers::new();
        let mut x2_reader = x2_observers.state.reader();
        queue.enqueue(x2, x2_observers, false).await.unwrap();

        let x3 = sample_record(&sample_request("https://x.example.com/3"));
        queue.enqueue(x3, TaskObservers::new(), false).await.unwrap();

        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 2);
        assert_eq!(x2_reader.get(), DownloadState::Queued);

        // Completing the first x task frees host x's one slot; the next
        // queued x task (x2, FIFO within the host) is promoted, not x3.
        engine.release("https://x.example.com/1");
        loop {
            match x2_reader.changed().await {
                Some(DownloadState::Downloading(_)) => break,
                Some(DownloadState::Completed(_)) => break,
                Some(_) => continue,
                None => panic!("x2's state channel closed before it started"),
            }
        }
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 1);

        if let Some(stored) = store.load(&x1_task_id).await.unwrap() {
            if let Some(path) = stored.output_path {
                std::fs::remove_file(path).ok();
            }
        }
        engine.release("https://x.example.com/2");
        engine.release("https://x.example.com/3");
        engine.release("https://y.example.com/1");
    }

    /// Spec scenario: `maxConcurrentDownloads=2`, two pre-existing active
    /// tasks (A=LOW, B=NORMAL), then an URGENT arrival C. A is the victim —
    /// active becomes `{B, C}`, queued becomes `[A]` — and completing
    /// either active task resumes A.
    #[tokio::test]
    async fn urgent_preemption_requeues_victim_and_resumes_it_once_a_slot_frees() {
        let engine = Arc::new(KeyedGateEngine::new(8));
        let http: Arc<dyn HttpEngine> = engine.clone();
        let cfg = QueueConfig { max_concurrent_downloads: 2, max_connections_per_host: 4, auto_start: true };
        let (queue, store) = build_queue(http, cfg).await;

        let mut low_req = sample_request("https://a.example.com/low");
        low_req.priority = Priority::Low;
        let low_record = sample_record(&low_req);
        let low_task_id = low_record.task_id;
        let low_observers = TaskObservers::new();
        let mut low_reader = low_observers.state.reader();
        queue.enqueue(low_record, low_observers, false).await.unwrap();
        engine.wait_until_started("https://a.example.com/low").await;

        let mut normal_req = sample_request("https://b.example.com/normal");
        normal_req.priority = Priority::Normal;
        let normal_record = sample_record(&normal_req);
        let normal_task_id = normal_record.task_id;
        queue.enqueue(normal_record, TaskObservers::new(), false).await.unwrap();
        engine.wait_until_started("https://b.example.com/normal").await;

        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 0);

        let mut urgent_req = sample_request("https://c.example.com/urgent");
        urgent_req.priority = Priority::Urgent;
        let urgent_record = sample_record(&urgent_req);
        let urgent_task_id = urgent_record.task_id;
        queue.enqueue(urgent_record, TaskObservers::new(), false).await.unwrap();

        // LOW is the only candidate strictly below URGENT's priority among
        // the active tasks, so it's the preemption victim.
        loop {
            match low_reader.changed().await {
                Some(DownloadState::Paused(_)) => break,
                Some(_) => continue,
                None => panic!("preempted task's state channel closed before pausing"),
            }
        }
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 1);
        assert_eq!(store.load(&low_task_id).await.unwrap().unwrap().state, TaskState::Paused);
        assert_eq!(store.load(&normal_task_id).await.unwrap().unwrap().state, TaskState::Downloading);
        assert_eq!(store.load(&urgent_task_id).await.unwrap().unwrap().state, TaskState::Downloading);

        // Completing URGENT frees a slot; LOW is promoted back into the
        // active set and resumed (it carries persisted segments/resume
        // state from the pause `requeue_victim` performed).
        engine.release("https://c.example.com/urgent");
        loop {
            match low_reader.changed().await {
                Some(DownloadState::Downloading(_)) => break,
                Some(DownloadState::Completed(_)) => break,
                Some(_) => continue,
                None => panic!("requeued task's state channel closed before resuming"),
            }
        }
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.queued_count(), 0);

        if let Some(stored) = store.load(&urgent_task_id).await.unwrap() {
            if let Some(path) = stored.output_path {
                std::fs::remove_file(path).ok();
            }
        }
        engine.release("https://a.example.com/low");
        engine.release("https://b.example.com/normal");
    }
}
