use serde::{Deserialize, Serialize};

use crate::model::request::DownloadRequest;
use crate::model::resume_state::SourceResumeState;
use crate::model::segment::Segment;
use crate::model::task_id::TaskId;

/// Persisted lifecycle state, stored as a string column by `TaskStore`
/// implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Scheduled,
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Scheduled => "scheduled",
            TaskState::Queued => "queued",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "scheduled" => TaskState::Scheduled,
            "queued" => TaskState::Queued,
            "downloading" => TaskState::Downloading,
            "paused" => TaskState::Paused,
            "completed" => TaskState::Completed,
            "failed" => TaskState::Failed,
            "canceled" => TaskState::Canceled,
            _ => return None,
        })
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Canceled)
    }
}

/// Canonical on-disk record. The system of record for a task; the runtime
/// `DownloadTask` view is derived from it and republished through an
/// observable cell (§3 Ownership and lifecycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub request: DownloadRequestRecord,
    pub state: TaskState,
    pub created_at: i64,
    pub updated_at: i64,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    pub output_path: Option<String>,
    pub segments: Option<Vec<Segment>>,
    pub source_resume_state: Option<SourceResumeState>,
    pub error_message: Option<String>,
}

/// Serializable projection of `DownloadRequest` for the `request` column.
/// `conditions` are intentionally dropped: they hold live, non-serializable
/// state and are never persisted (§4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequestRecord {
    pub url: String,
    pub destination: String,
    pub is_directory: bool,
    pub file_name: Option<String>,
    pub connections: usize,
    pub headers: std::collections::BTreeMap<String, String>,
    pub priority: crate::model::request::Priority,
    pub speed_limit: crate::config::SpeedLimit,
    pub schedule: crate::model::request::Schedule,
    pub selected_file_ids: std::collections::BTreeSet<String>,
}

impl From<&DownloadRequest> for DownloadRequestRecord {
    fn from(req: &DownloadRequest) -> Self {
        use crate::model::request::Destination;
        let (destination, is_directory) = match &req.destination {
            Destination::Directory(p) => (p.to_string_lossy().into_owned(), true),
            Destination::File(p) => (p.to_string_lossy().into_owned(), false),
        };
        Self {
            url: req.url.clone(),
            destination,
            is_directory,
            file_name: req.file_name.clone(),
            connections: req.connections,
            headers: req.headers.clone(),
            priority: req.priority,
            speed_limit: req.speed_limit,
            schedule: req.schedule.clone(),
            selected_file_ids: req.selected_file_ids.clone(),
        }
    }
}

impl DownloadRequestRecord {
    pub fn to_request(&self) -> DownloadRequest {
        use crate::model::request::Destination;
        let destination = if self.is_directory {
            Destination::Directory(self.destination.clone().into())
        } else {
            Destination::File(self.destination.clone().into())
        };
        DownloadRequest {
            url: self.url.clone(),
            destination,
            file_name: self.file_name.clone(),
            connections: self.connections,
            headers: self.headers.clone(),
            priority: self.priority,
            speed_limit: self.speed_limit,
            schedule: self.schedule.clone(),
            conditions: Vec::new(),
            selected_file_ids: self.selected_file_ids.clone(),
            resolved_source: None,
        }
    }
}
