//! `ketch add <url>` – add a download and drive it to completion.

use anyhow::{bail, Result};
use ketch_core::config::KetchConfig;
use ketch_core::model::request::{Destination, DownloadRequest};
use ketch_core::model::DownloadState;
use std::path::PathBuf;

use super::progress::{build_engine, watch_to_terminal};

pub async fn run_add(
    mut cfg: KetchConfig,
    url: &str,
    download_dir: Option<PathBuf>,
    connections: Option<usize>,
) -> Result<()> {
    if let Some(n) = connections {
        cfg.max_connections = n.max(1);
    }
    let dir = download_dir.unwrap_or(std::env::current_dir()?);
    let engine = build_engine(cfg.clone()).await?;

    let mut request = DownloadRequest::new(url, Destination::Directory(dir));
    request.connections = cfg.max_connections;
    let task = engine.download(request).await?;
    println!("Added task {}", task.id());

    let state = watch_to_terminal(&task.id().to_string(), task.clone()).await;
    engine.close().await;

    match state {
        DownloadState::Completed(path) => {
            println!("Completed: {}", path.display());
            Ok(())
        }
        DownloadState::Failed(err) => bail!("download failed: {err}"),
        DownloadState::Canceled => bail!("download was canceled"),
        other => bail!("download ended in unexpected state: {other:?}"),
    }
}
