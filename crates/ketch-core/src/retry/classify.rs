use crate::error::KetchError;
use crate::retry::policy::ErrorKind;

/// Maps a `KetchError` onto the retry taxonomy (§7): `Network` and
/// `Http(5xx | 429)` are retryable; everything else is terminal.
pub fn classify(err: &KetchError) -> ErrorKind {
    match err {
        KetchError::Network(_) => ErrorKind::Network,
        KetchError::Http { code: 429, .. } => ErrorKind::Throttled,
        KetchError::Http { code, .. } if (500..600).contains(code) => ErrorKind::Http5xx(*code),
        _ => ErrorKind::Terminal,
    }
}
