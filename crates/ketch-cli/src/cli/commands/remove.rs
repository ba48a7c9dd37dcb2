//! `ketch remove <id>` – forget a task. Does not reach into an
//! already-running `ketch run` process; a live task should be paused first.

use anyhow::{Context, Result};
use ketch_core::model::TaskId;
use ketch_core::store::{SqliteTaskStore, TaskStore};

pub async fn run_remove(id: &str) -> Result<()> {
    let task_id: TaskId = id.parse().context("invalid task id")?;
    let store = SqliteTaskStore::open_default().await?;
    store.load(&task_id).await?.with_context(|| format!("no such task {id}"))?;
    store.remove(&task_id).await?;
    println!("Removed {id}");
    Ok(())
}
