//! Global configuration loaded from `~/.config/ketch/config.toml`.
//!
//! Covers the full configuration surface: default segment count,
//! retry/backoff tuning, progress/save cadence, speed limit, and queue
//! caps.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

/// `speedLimit`: unlimited, or a positive bytes/sec cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "bytesPerSecond", rename_all = "camelCase")]
pub enum SpeedLimit {
    Unlimited,
    BytesPerSecond(u64),
}

impl Default for SpeedLimit {
    fn default() -> Self {
        SpeedLimit::Unlimited
    }
}

/// `queueConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub max_concurrent_downloads: usize,
    pub max_connections_per_host: usize,
    pub auto_start: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            max_connections_per_host: 2,
            auto_start: true,
        }
    }
}

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KetchConfig {
    /// Default segment count per task (`maxConnections`, spec §6.6).
    pub max_connections: usize,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub progress_update_interval_ms: u64,
    pub segment_save_interval_ms: u64,
    pub buffer_size: usize,
    pub speed_limit: SpeedLimit,
    pub queue: QueueConfig,
}

impl Default for KetchConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            retry_count: 5,
            retry_delay_ms: 250,
            progress_update_interval_ms: 200,
            segment_save_interval_ms: 5_000,
            buffer_size: 64 * 1024,
            speed_limit: SpeedLimit::Unlimited,
            queue: QueueConfig::default(),
        }
    }
}

pub fn config_path() -> Result<PathBuf> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("ketch")?;
    Ok(xdg_dirs.place_config_file("config.toml")?)
}

/// Load configuration from disk, creating a default file if none exists.
pub fn load_or_init() -> Result<KetchConfig> {
    let path = config_path()?;
    if !path.exists() {
        let default_cfg = KetchConfig::default();
        let toml = toml::to_string_pretty(&default_cfg)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, toml)?;
        tracing::info!("created default config at {}", path.display());
        return Ok(default_cfg);
    }

    let data = fs::read_to_string(&path)?;
    let cfg: KetchConfig = toml::from_str(&data)?;
    Ok(cfg)
}
