//! SQLite-backed `TaskStore`: a single-file database under the XDG state
//! dir, a `CREATE TABLE IF NOT EXISTS` migration on open, `?N`-bound
//! queries, and JSON-encoded columns for `TaskRecord`'s nested
//! `request`/`segments`/`source_resume_state` fields.

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Row, Sqlite};

use crate::error::KetchError;
use crate::model::{DownloadRequestRecord, Segment, SourceResumeState, TaskId, TaskRecord, TaskState};
use crate::store::TaskStore;

fn store_err(e: impl std::error::Error + Send + Sync + 'static) -> KetchError {
    KetchError::Disk(anyhow::Error::new(e))
}

fn json_err(e: serde_json::Error) -> KetchError {
    KetchError::Disk(anyhow::Error::new(e))
}

#[derive(Clone)]
pub struct SqliteTaskStore {
    pool: Pool<Sqlite>,
}

impl SqliteTaskStore {
    /// Opens (creating if needed) the default database under the XDG state
    /// directory: `~/.local/state/ketch/tasks.db`.
    pub async fn open_default() -> Result<Self, KetchError> {
        let xdg_dirs = xdg::BaseDirectories::with_prefix("ketch").map_err(store_err)?;
        let state_dir = xdg_dirs.get_state_home();
        tokio::fs::create_dir_all(&state_dir).await.map_err(store_err)?;
        let db_path = state_dir.join("tasks.db");
        Self::open_path(&db_path.to_string_lossy()).await
    }

    /// Opens an explicit SQLite URI, e.g. `sqlite::memory:` for tests.
    pub async fn open_path(uri: &str) -> Result<Self, KetchError> {
        let uri = if uri.starts_with("sqlite:") { uri.to_string() } else { format!("sqlite://{uri}") };
        let pool = SqlitePoolOptions::new().max_connections(8).connect(&uri).await.map_err(store_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), KetchError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                request_json TEXT NOT NULL,
                state TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                downloaded_bytes INTEGER NOT NULL,
                output_path TEXT,
                segments_json TEXT,
                source_resume_state_json TEXT,
                error_message TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<TaskRecord, KetchError> {
        let task_id_str: String = row.get("task_id");
        let task_id: TaskId = task_id_str.parse().map_err(|_| KetchError::CorruptResumeState)?;

        let request_json: String = row.get("request_json");
        let request: DownloadRequestRecord = serde_json::from_str(&request_json).map_err(json_err)?;

        let state_str: String = row.get("state");
        let state = TaskState::from_str(&state_str).ok_or(KetchError::CorruptResumeState)?;

        let segments_json: Option<String> = row.get("segments_json");
        let segments: Option<Vec<Segment>> =
            segments_json.as_deref().map(serde_json::from_str).transpose().map_err(json_err)?;

        let resume_json: Option<String> = row.get("source_resume_state_json");
        let source_resume_state: Option<SourceResumeState> =
            resume_json.as_deref().map(serde_json::from_str).transpose().map_err(json_err)?;

        Ok(TaskRecord {
            task_id,
            request,
            state,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
            total_bytes: row.get("total_bytes"),
            downloaded_bytes: row.get("downloaded_bytes"),
            output_path: row.get("output_path"),
            segments,
            source_resume_state,
            error_message: row.get("error_message"),
        })
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<(), KetchError> {
        let request_json = serde_json::to_string(&record.request).map_err(json_err)?;
        let segments_json = record.segments.as_ref().map(serde_json::to_string).transpose().map_err(json_err)?;
        let resume_json =
            record.source_resume_state.as_ref().map(serde_json::to_string).transpose().map_err(json_err)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                task_id, request_json, state, created_at, updated_at,
                total_bytes, downloaded_bytes, output_path, segments_json,
                source_resume_state_json, error_message
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(task_id) DO UPDATE SET
                request_json = excluded.request_json,
                state = excluded.state,
                updated_at = excluded.updated_at,
                total_bytes = excluded.total_bytes,
                downloaded_bytes = excluded.downloaded_bytes,
                output_path = excluded.output_path,
                segments_json = excluded.segments_json,
                source_resume_state_json = excluded.source_resume_state_json,
                error_message = excluded.error_message
            "#,
        )
        .bind(record.task_id.as_str())
        .bind(request_json)
        .bind(record.state.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.total_bytes)
        .bind(record.downloaded_bytes)
        .bind(&record.output_path)
        .bind(segments_json)
        .bind(resume_json)
        .bind(&record.error_message)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(())
    }

    async fn load(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, KetchError> {
        let row = sqlx::query("SELECT * FROM tasks WHERE task_id = ?1")
            .bind(task_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn load_all(&self) -> Result<Vec<TaskRecord>, KetchError> {
        let rows = sqlx::query("SELECT * FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn remove(&self, task_id: &TaskId) -> Result<(), KetchError> {
        sqlx::query("DELETE FROM tasks WHERE task_id = ?1")
            .bind(task_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}
