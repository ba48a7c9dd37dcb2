//! `ketch status` – show every persisted task and its last known state.

use anyhow::Result;
use ketch_core::store::{SqliteTaskStore, TaskStore};

pub async fn run_status() -> Result<()> {
    let store = SqliteTaskStore::open_default().await?;
    let records = store.load_all().await?;

    if records.is_empty() {
        println!("No tasks.");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<12} {}", "ID", "STATE", "BYTES", "URL");
    for record in records {
        let bytes = if record.total_bytes > 0 {
            format!("{}/{}", record.downloaded_bytes, record.total_bytes)
        } else {
            format!("{}", record.downloaded_bytes)
        };
        println!("{:<38} {:<12} {:<12} {}", record.task_id, record.state.as_str(), bytes, record.request.url);
    }
    Ok(())
}
