use serde::{Deserialize, Serialize};

/// What a HEAD probe (or a 200/206 response's headers) revealed about the
/// remote resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub content_length: Option<i64>,
    pub accepts_byte_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub content_disposition: Option<String>,
    pub rate_limit_remaining: Option<u64>,
    pub rate_limit_reset: Option<u64>,
}

impl ServerInfo {
    /// §4.2: resume requires range support *and* a server-identity anchor.
    pub fn supports_resume(&self) -> bool {
        self.accepts_byte_ranges && (self.etag.is_some() || self.last_modified.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resume_requires_ranges_and_identity() {
        let mut info = ServerInfo { accepts_byte_ranges: true, ..Default::default() };
        assert!(!info.supports_resume());
        info.etag = Some("\"v1\"".into());
        assert!(info.supports_resume());
    }

    #[test]
    fn resume_false_without_range_support() {
        let info = ServerInfo {
            accepts_byte_ranges: false,
            etag: Some("\"v1\"".into()),
            ..Default::default()
        };
        assert!(!info.supports_resume());
    }
}
