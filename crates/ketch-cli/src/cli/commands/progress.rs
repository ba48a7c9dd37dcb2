//! Shared engine bootstrap and progress printing for the commands that
//! drive a download to completion.

use anyhow::{Context, Result};
use ketch_core::config::KetchConfig;
use ketch_core::model::DownloadState;
use ketch_core::{DownloadTask, Ketch};
use std::sync::Arc;
use std::time::Instant;

/// Builds the default engine (curl transport, SQLite store under the XDG
/// state dir). Constructing it rehydrates every persisted, unfinished task.
pub async fn build_engine(cfg: KetchConfig) -> Result<Arc<Ketch>> {
    Ketch::new(cfg).await.context("failed to start the download engine")
}

const PROGRESS_INTERVAL_MS: u64 = 500;

/// Prints periodic progress lines for `task` until it reaches a terminal
/// state, then returns that state.
pub async fn watch_to_terminal(label: &str, task: DownloadTask) -> DownloadState {
    let mut reader = task.watch_state();
    let mut last_print = Instant::now();
    let mut state = reader.get();
    print_line(label, &state);

    loop {
        if state.is_terminal() {
            return state;
        }
        match reader.changed().await {
            Some(next) => {
                state = next;
                let now = Instant::now();
                if now.duration_since(last_print).as_millis() as u64 >= PROGRESS_INTERVAL_MS || state.is_terminal() {
                    print_line(label, &state);
                    last_print = now;
                }
            }
            None => return state,
        }
    }
}

fn print_line(label: &str, state: &DownloadState) {
    match state {
        DownloadState::Downloading(progress) | DownloadState::Paused(progress) => {
            let done_mib = progress.downloaded_bytes as f64 / 1_048_576.0;
            let total_mib = progress.total_bytes as f64 / 1_048_576.0;
            let rate_mib = progress.bytes_per_second / 1_048_576.0;
            println!(
                "{label}: {done_mib:.1} / {total_mib:.1} MiB ({:.1}%)  {rate_mib:.2} MiB/s",
                progress.percent * 100.0
            );
        }
        other => println!("{label}: {other:?}"),
    }
}
