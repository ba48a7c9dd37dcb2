//! `ketch resume <id>` – mark a paused task queued again. Actual byte
//! movement happens on the next `ketch run`, same as `ketch add`'s model.

use anyhow::{bail, Context, Result};
use ketch_core::model::{TaskId, TaskState};
use ketch_core::store::{SqliteTaskStore, TaskStore};

fn unix_timestamp() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_secs() as i64
}

pub async fn run_resume(id: &str) -> Result<()> {
    let task_id: TaskId = id.parse().context("invalid task id")?;
    let store = SqliteTaskStore::open_default().await?;
    let mut record = store.load(&task_id).await?.with_context(|| format!("no such task {id}"))?;
    if record.state.is_terminal() {
        bail!("task {id} already finished ({})", record.state.as_str());
    }
    record.state = TaskState::Queued;
    record.updated_at = unix_timestamp();
    store.save(&record).await?;
    println!("Resumed {id}; run `ketch run` to continue the transfer");
    Ok(())
}
