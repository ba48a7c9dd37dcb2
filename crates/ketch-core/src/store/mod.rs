//! Durable `TaskRecord` persistence (§6.3). `SqliteTaskStore` is the only
//! built-in implementation: one row per `TaskRecord`.

mod sqlite;

pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;

use crate::error::KetchError;
use crate::model::{TaskId, TaskRecord};

/// CRUD over `TaskRecord` (§6.3). Implementations own how records are
/// serialized; the engine only calls `save`/`load`/`load_all`/`remove`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, record: &TaskRecord) -> Result<(), KetchError>;
    async fn load(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, KetchError>;
    async fn load_all(&self) -> Result<Vec<TaskRecord>, KetchError>;
    async fn remove(&self, task_id: &TaskId) -> Result<(), KetchError>;
}
