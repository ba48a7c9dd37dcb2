//! `ketch run` – resume every persisted, unfinished task and wait for all of them.

use anyhow::Result;
use ketch_core::config::KetchConfig;
use ketch_core::model::TaskState;
use ketch_core::store::{SqliteTaskStore, TaskStore};

use super::progress::{build_engine, watch_to_terminal};

pub async fn run_run(cfg: KetchConfig) -> Result<()> {
    // Opened separately from the engine just to enumerate task ids; the
    // engine itself already rehydrated (and started driving) every
    // non-terminal record against the same database on construction.
    let store = SqliteTaskStore::open_default().await?;
    let records = store.load_all().await?;
    let paused = records.iter().filter(|r| r.state == TaskState::Paused).count();
    let pending: Vec<_> =
        records.into_iter().filter(|r| matches!(r.state, TaskState::Scheduled | TaskState::Queued | TaskState::Downloading)).collect();

    if paused > 0 {
        println!("Skipping {paused} paused task(s); resume them first.");
    }
    if pending.is_empty() {
        println!("No unfinished tasks.");
        return Ok(());
    }

    let engine = build_engine(cfg).await?;
    let handles: Vec<_> = pending
        .iter()
        .filter_map(|record| {
            let task = engine.task(record.task_id)?;
            let label = record.task_id.to_string();
            Some(tokio::spawn(async move { watch_to_terminal(&label, task).await }))
        })
        .collect();

    let mut finished = 0u32;
    for handle in handles {
        if handle.await.is_ok() {
            finished += 1;
        }
    }

    engine.close().await;
    println!("Finished {finished} task(s).");
    Ok(())
}
