//! CLI for the Ketch download engine.

mod commands;
#[cfg(test)]
mod tests;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use commands::{run_add, run_pause, run_remove, run_resume, run_run, run_status};

/// Top-level CLI for the Ketch download engine.
#[derive(Debug, Parser)]
#[command(name = "ketch")]
#[command(about = "Ketch: segmented download engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Add a download and drive it to completion.
    Add {
        /// Direct HTTP/HTTPS URL to download.
        url: String,
        /// Directory where the file will be saved (default: current directory).
        #[arg(long, value_name = "DIR")]
        download_dir: Option<PathBuf>,
        /// Number of segments to split the transfer into (default: config's `maxConnections`).
        #[arg(long, value_name = "N")]
        connections: Option<usize>,
    },

    /// Resume supervising every persisted task that was not finished, until all of them are.
    Run,

    /// Show every persisted task and its last known state.
    Status,

    /// Pause a task by id.
    Pause {
        /// Task identifier (as printed by `add`/`status`).
        id: String,
    },

    /// Resume a paused task by id.
    Resume {
        /// Task identifier.
        id: String,
    },

    /// Cancel a task and forget it.
    Remove {
        /// Task identifier.
        id: String,
    },
}

impl CliCommand {
    pub async fn run_from_args() -> Result<()> {
        let cli = Cli::parse();
        let cfg = ketch_core::config::load_or_init()?;
        tracing::debug!("loaded config: {:?}", cfg);

        match cli.command {
            CliCommand::Add { url, download_dir, connections } => {
                let dir = download_dir.or_else(|| std::env::current_dir().ok());
                run_add(cfg, &url, dir, connections).await?
            }
            CliCommand::Run => run_run(cfg).await?,
            CliCommand::Status => run_status().await?,
            CliCommand::Pause { id } => run_pause(&id).await?,
            CliCommand::Resume { id } => run_resume(&id).await?,
            CliCommand::Remove { id } => run_remove(&id).await?,
        }

        Ok(())
    }
}
