use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One file offered by a multi-file source (e.g. a torrent or archive
/// manifest). Single-file HTTP downloads report exactly one `SourceFile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: String,
    pub name: String,
    pub size: i64,
}

/// How the caller is expected to pick from `ResolvedSource::files`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionMode {
    /// Exactly one file; no selection needed.
    Single,
    /// One or more of `files` may be selected.
    Multiple,
    /// The source has no concept of file selection.
    None,
}

/// What a `DownloadSource` learned from probing a URL, before any bytes
/// are transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedSource {
    pub url: String,
    pub source_type: String,
    /// `-1` if unknown.
    pub total_bytes: i64,
    pub supports_resume: bool,
    pub suggested_file_name: Option<String>,
    pub max_segments: usize,
    pub metadata: BTreeMap<String, String>,
    pub files: Vec<SourceFile>,
    pub selection_mode: SelectionMode,
}

impl ResolvedSource {
    pub fn has_known_length(&self) -> bool {
        self.total_bytes >= 0
    }
}
