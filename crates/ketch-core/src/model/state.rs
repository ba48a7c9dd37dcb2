use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::KetchError;
use crate::model::request::Schedule;

/// Bytes-per-second / percent snapshot published to observers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    pub bytes_per_second: f64,
    pub percent: f64,
}

impl DownloadProgress {
    pub fn new(downloaded_bytes: i64, total_bytes: i64, bytes_per_second: f64) -> Self {
        let percent = if total_bytes > 0 {
            downloaded_bytes as f64 / total_bytes as f64
        } else {
            0.0
        };
        Self { downloaded_bytes, total_bytes, bytes_per_second, percent }
    }
}

/// Runtime state published through the task's observable `state` cell.
#[derive(Debug, Clone)]
pub enum DownloadState {
    Idle,
    Scheduled(Schedule),
    Queued,
    Pending,
    Downloading(DownloadProgress),
    Paused(DownloadProgress),
    Completed(std::path::PathBuf),
    Failed(Arc<KetchError>),
    Canceled,
}

// `Cell<T>` (§6.5) requires `PartialEq` to coalesce unchanged updates.
// `Failed` carries a `KetchError`, which isn't comparable, so two `Failed`
// states are never considered equal — a redundant republish there is
// harmless, unlike silently dropping one.
impl PartialEq for DownloadState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DownloadState::Idle, DownloadState::Idle) => true,
            (DownloadState::Scheduled(a), DownloadState::Scheduled(b)) => a == b,
            (DownloadState::Queued, DownloadState::Queued) => true,
            (DownloadState::Pending, DownloadState::Pending) => true,
            (DownloadState::Downloading(a), DownloadState::Downloading(b)) => a == b,
            (DownloadState::Paused(a), DownloadState::Paused(b)) => a == b,
            (DownloadState::Completed(a), DownloadState::Completed(b)) => a == b,
            (DownloadState::Failed(_), DownloadState::Failed(_)) => false,
            (DownloadState::Canceled, DownloadState::Canceled) => true,
            _ => false,
        }
    }
}

impl DownloadState {
    pub fn is_active(&self) -> bool {
        matches!(self, DownloadState::Downloading(_) | DownloadState::Pending)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DownloadState::Completed(_) | DownloadState::Failed(_) | DownloadState::Canceled
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_percent_zero_for_unknown_total() {
        let p = DownloadProgress::new(100, 0, 0.0);
        assert_eq!(p.percent, 0.0);
    }

    #[test]
    fn progress_percent_computed() {
        let p = DownloadProgress::new(50, 200, 0.0);
        assert_eq!(p.percent, 0.25);
    }

    #[test]
    fn active_and_terminal_classification() {
        assert!(DownloadState::Pending.is_active());
        assert!(DownloadState::Downloading(DownloadProgress::default()).is_active());
        assert!(!DownloadState::Queued.is_active());
        assert!(DownloadState::Canceled.is_terminal());
        assert!(!DownloadState::Paused(DownloadProgress::default()).is_terminal());
    }
}
