//! Data model shared by the coordinator, queue, scheduler, and stores.

pub mod request;
pub mod resolved_source;
pub mod resume_state;
pub mod segment;
pub mod server_info;
pub mod state;
pub mod task_id;
pub mod task_record;

pub use request::{Condition, Destination, DownloadRequest, Priority, Schedule};
pub use resolved_source::{ResolvedSource, SelectionMode, SourceFile};
pub use resume_state::{HttpResumeData, SourceResumeState};
pub use segment::Segment;
pub use server_info::ServerInfo;
pub use state::{DownloadProgress, DownloadState};
pub use task_id::TaskId;
pub use task_record::{DownloadRequestRecord, TaskRecord, TaskState};
