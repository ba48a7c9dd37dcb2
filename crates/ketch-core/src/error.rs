//! Error taxonomy for the download engine.
//!
//! Mirrors the classes a caller needs to branch on (retry vs terminal,
//! user-facing message) rather than the underlying transport's error types.

use std::fmt;
use std::time::Duration;

/// Error surfaced by the engine to observers and to the coordinator's retry logic.
#[derive(Debug)]
pub enum KetchError {
    /// Transport-level failure before or during byte transfer.
    Network(anyhow::Error),
    /// Non-2xx HTTP response.
    Http {
        code: u16,
        message: String,
        retry_after: Option<Duration>,
        remaining: Option<u64>,
    },
    /// Any file-system failure from a `FileAccessor`.
    Disk(anyhow::Error),
    /// No source handles the URL, or a required capability is missing.
    Unsupported(String),
    /// Server identity (etag/last-modified/size) changed across a resume.
    FileChanged,
    /// Stored `SourceResumeState` could not be decoded.
    CorruptResumeState,
    /// Source-specific authentication rejected.
    AuthenticationFailed,
    /// Any other protocol-level error a source chooses to surface as terminal.
    SourceError { source_type: String, cause: anyhow::Error },
    /// User-initiated termination. Terminal, but not a failure.
    Canceled,
    /// Fallback.
    Unknown(anyhow::Error),
}

impl KetchError {
    /// True for `5xx` and `429` responses per spec §7.
    pub fn is_retryable(&self) -> bool {
        match self {
            KetchError::Network(_) => true,
            KetchError::Http { code, .. } => *code == 429 || (500..600).contains(code),
            _ => false,
        }
    }
}

impl fmt::Display for KetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KetchError::Network(e) => write!(f, "network error: {e}"),
            KetchError::Http { code, message, .. } => write!(f, "http {code}: {message}"),
            KetchError::Disk(e) => write!(f, "disk error: {e}"),
            KetchError::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            KetchError::FileChanged => write!(f, "remote file changed since last resume"),
            KetchError::CorruptResumeState => write!(f, "resume state could not be decoded"),
            KetchError::AuthenticationFailed => write!(f, "authentication failed"),
            KetchError::SourceError { source_type, cause } => {
                write!(f, "source error ({source_type}): {cause}")
            }
            KetchError::Canceled => write!(f, "canceled"),
            KetchError::Unknown(e) => write!(f, "unknown error: {e}"),
        }
    }
}

impl std::error::Error for KetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KetchError::Network(e) | KetchError::Disk(e) | KetchError::Unknown(e) => {
                Some(e.as_ref())
            }
            KetchError::SourceError { cause, .. } => Some(cause.as_ref()),
            _ => None,
        }
    }
}
