use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::SpeedLimit;
use crate::model::resolved_source::ResolvedSource;

/// Relative admission priority. Ordered `LOW < NORMAL < HIGH < URGENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Urgent => "URGENT",
        };
        write!(f, "{s}")
    }
}

/// Where the request wants to start relative to enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    Immediate,
    AtTime(SystemTime),
    AfterDelay(Duration),
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Immediate
    }
}

/// A lazy boolean gate the scheduler polls until it yields `true`.
///
/// Conditions are not part of `TaskRecord` (they hold live state, e.g. a
/// network-reachability check) and are therefore never persisted; a
/// restored `Scheduled` task is gated by its `schedule` alone (§4.8).
pub trait Condition: Send + Sync {
    fn is_satisfied(&self) -> bool;
}

/// Destination: either a bare directory (filename derived from the
/// resolved source) or a full file path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Destination {
    Directory(PathBuf),
    File(PathBuf),
}

#[derive(Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub destination: Destination,
    pub file_name: Option<String>,
    pub connections: usize,
    pub headers: BTreeMap<String, String>,
    pub priority: Priority,
    pub speed_limit: SpeedLimit,
    pub schedule: Schedule,
    pub conditions: Vec<Arc<dyn Condition>>,
    pub selected_file_ids: BTreeSet<String>,
    /// Set when a caller already resolved the source out-of-band (e.g. a
    /// rehydrated task) to skip a redundant probe.
    pub resolved_source: Option<ResolvedSource>,
}

impl fmt::Debug for DownloadRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadRequest")
            .field("url", &self.url)
            .field("destination", &self.destination)
            .field("file_name", &self.file_name)
            .field("connections", &self.connections)
            .field("priority", &self.priority)
            .field("speed_limit", &self.speed_limit)
            .field("schedule", &self.schedule)
            .field("conditions", &self.conditions.len())
            .field("selected_file_ids", &self.selected_file_ids)
            .finish()
    }
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>, destination: Destination) -> Self {
        Self {
            url: url.into(),
            destination,
            file_name: None,
            connections: 4,
            headers: BTreeMap::new(),
            priority: Priority::Normal,
            speed_limit: SpeedLimit::Unlimited,
            schedule: Schedule::Immediate,
            conditions: Vec::new(),
            selected_file_ids: BTreeSet::new(),
            resolved_source: None,
        }
    }

    pub fn is_gated(&self) -> bool {
        !matches!(self.schedule, Schedule::Immediate) || !self.conditions.is_empty()
    }
}
