//! `DownloadScheduler` (§4.7): time/condition gating in front of the queue.
//!
//! A gated request is never handed to `DownloadQueue` until its `schedule`
//! has elapsed and every `Condition` is simultaneously satisfied. Each
//! gate runs as a cancellable wait-then-enqueue task of its own.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use tokio::sync::Notify;
use tracing::warn;

use crate::coordinator::TaskObservers;
use crate::error::KetchError;
use crate::model::request::{Condition, Schedule};
use crate::model::{DownloadState, TaskId, TaskRecord, TaskState};
use crate::queue::DownloadQueue;
use crate::store::TaskStore;

/// Re-check cadence for condition conjunction and `AtTime` clock drift.
const CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(100);

fn unix_timestamp() -> i64 {
    use std::time::UNIX_EPOCH;
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

enum GateOutcome {
    Satisfied,
    Canceled,
}

/// Waits on `schedule` then on the conjunction of `conditions`, bailing out
/// early if `canceled` is set or `notify` fires (§4.7 steps 1-2).
async fn wait_gate(schedule: &Schedule, conditions: &[Arc<dyn Condition>], canceled: &AtomicBool, notify: &Notify) -> GateOutcome {
    match schedule {
        Schedule::Immediate => {}
        Schedule::AfterDelay(d) => {
            tokio::select! {
                _ = tokio::time::sleep(*d) => {}
                _ = notify.notified() => return GateOutcome::Canceled,
            }
        }
        Schedule::AtTime(t) => {
            let delay = t.duration_since(SystemTime::now()).unwrap_or_default();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = notify.notified() => return GateOutcome::Canceled,
            }
        }
    }
    if canceled.load(Ordering::SeqCst) {
        return GateOutcome::Canceled;
    }

    loop {
        if conditions.iter().all(|c| c.is_satisfied()) {
            return GateOutcome::Satisfied;
        }
        tokio::select! {
            _ = tokio::time::sleep(CONDITION_POLL_INTERVAL) => {}
            _ = notify.notified() => return GateOutcome::Canceled,
        }
        if canceled.load(Ordering::SeqCst) {
            return GateOutcome::Canceled;
        }
    }
}

struct GatedJob {
    canceled: Arc<AtomicBool>,
    notify: Arc<Notify>,
    handle: tokio::task::JoinHandle<()>,
}

impl GatedJob {
    fn cancel(self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        self.handle.abort();
    }
}

/// Gates scheduled/conditioned requests ahead of `DownloadQueue` (§4.7).
/// Immediate, unconditioned requests pass straight through to `enqueue`.
pub struct DownloadScheduler {
    queue: Arc<DownloadQueue>,
    store: Arc<dyn TaskStore>,
    jobs: StdMutex<HashMap<TaskId, GatedJob>>,
}

impl DownloadScheduler {
    pub fn new(queue: Arc<DownloadQueue>, store: Arc<dyn TaskStore>) -> Arc<Self> {
        Arc::new(Self { queue, store, jobs: StdMutex::new(HashMap::new()) })
    }

    /// Gates `record` behind `schedule`/`conditions`, or enqueues it
    /// directly when neither applies. `record.request.schedule` is updated
    /// to match so the persisted record and the live gate agree.
    pub async fn schedule(
        self: &Arc<Self>,
        mut record: TaskRecord,
        observers: TaskObservers,
        schedule: Schedule,
        conditions: Vec<Arc<dyn Condition>>,
    ) -> Result<(), KetchError> {
        record.request.schedule = schedule.clone();

        if matches!(schedule, Schedule::Immediate) && conditions.is_empty() {
            return self.queue.enqueue(record, observers, true).await;
        }

        let task_id = record.task_id;
        record.state = TaskState::Scheduled;
        record.updated_at = unix_timestamp();
        self.store.save(&record).await?;
        observers.state.set(DownloadState::Scheduled(schedule.clone()));

        self.spawn_gated(record, observers, schedule, conditions);
        Ok(())
    }

    fn spawn_gated(
        self: &Arc<Self>,
        record: TaskRecord,
        observers: TaskObservers,
        schedule: Schedule,
        conditions: Vec<Arc<dyn Condition>>,
    ) {
        let task_id = record.task_id;
        let canceled = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let canceled_task = Arc::clone(&canceled);
        let notify_task = Arc::clone(&notify);
        let scheduler = Arc::clone(self);
        let queue = Arc::clone(&self.queue);
        let store = Arc::clone(&self.store);

        let handle = tokio::spawn(async move {
            let outcome = wait_gate(&schedule, &conditions, &canceled_task, &notify_task).await;
            scheduler.jobs.lock().unwrap().remove(&task_id);

            match outcome {
                GateOutcome::Satisfied => {
                    if let Err(e) = queue.enqueue(record, observers, true).await {
                        warn!(task = %task_id, error = %e, "gated task failed to enqueue on satisfaction");
                    }
                }
                GateOutcome::Canceled => {
                    observers.state.set(DownloadState::Canceled);
                    if let Ok(Some(mut stored)) = store.load(&task_id).await {
                        stored.state = TaskState::Canceled;
                        stored.updated_at = unix_timestamp();
                        let _ = store.save(&stored).await;
                    }
                }
            }
        });

        self.jobs.lock().unwrap().insert(task_id, GatedJob { canceled, notify, handle });
    }

    /// Cancels a still-gated task directly to `Canceled` (§4.7). Only
    /// handles tasks that haven't yet reached the queue — returns `false`
    /// in that case so the caller knows to fall through to
    /// `DownloadQueue::dequeue` instead.
    pub async fn cancel(self: &Arc<Self>, task_id: TaskId, observers: &TaskObservers) -> Result<bool, KetchError> {
        let job = self.jobs.lock().unwrap().remove(&task_id);
        let Some(job) = job else {
            return Ok(false);
        };
        job.cancel();

        if let Some(mut record) = self.store.load(&task_id).await? {
            record.state = TaskState::Canceled;
            record.updated_at = unix_timestamp();
            self.store.save(&record).await?;
        }
        observers.state.set(DownloadState::Canceled);
        Ok(true)
    }

    /// `reschedule(task, schedule, conditions)` (§4.7): cancels any existing
    /// gated job, pauses/dequeues the task if it already reached the queue,
    /// then re-gates it under the new schedule. `observers` must be the
    /// same handle the caller originally subscribed to, so continuity is
    /// preserved across the regate.
    pub async fn reschedule(
        self: &Arc<Self>,
        task_id: TaskId,
        observers: TaskObservers,
        schedule: Schedule,
        conditions: Vec<Arc<dyn Condition>>,
    ) -> Result<(), KetchError> {
        if let Some(job) = self.jobs.lock().unwrap().remove(&task_id) {
            job.cancel();
        }

        let record = match self.queue.withdraw(task_id).await? {
            Some((record, _)) => record,
            None => self
                .store
                .load(&task_id)
                .await?
                .ok_or_else(|| KetchError::Unsupported(format!("no such task {task_id}")))?,
        };

        self.schedule(record, observers, schedule, conditions).await
    }
}
