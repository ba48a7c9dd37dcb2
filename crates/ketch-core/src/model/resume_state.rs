use serde::{Deserialize, Serialize};

/// Opaque, source-owned resume blob. The engine stores and returns it
/// verbatim; only the source that produced it decodes the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResumeState {
    pub source_type: String,
    pub data: String,
}

/// Payload `HttpDownloadSource` encodes into `SourceResumeState::data`
/// (§4.2 `resume`): `{ totalBytes, etag?, lastModified? }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpResumeData {
    pub total_bytes: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl HttpResumeData {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}
